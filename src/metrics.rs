// Prometheus metrics definitions for the bot panel backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// 1 while the bot holds a connection, 0 otherwise.
    pub static ref BOT_ONLINE: IntGauge =
        IntGauge::new("botpanel_bot_online", "Whether the bot is currently connected").unwrap();

    /// Live console WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("botpanel_connected_websockets", "Live console WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    pub static ref BOT_CONNECT_ATTEMPTS_TOTAL: IntCounter = IntCounter::new(
        "botpanel_bot_connect_attempts_total",
        "Connections requested from the game client",
    )
    .unwrap();

    pub static ref BOT_DISCONNECTS_TOTAL: IntCounter = IntCounter::new(
        "botpanel_bot_disconnects_total",
        "Connections that ended without an explicit stop",
    )
    .unwrap();

    pub static ref BOT_KICKS_TOTAL: IntCounter =
        IntCounter::new("botpanel_bot_kicks_total", "Times the server kicked the bot").unwrap();

    pub static ref BOT_RECONNECTS_SCHEDULED_TOTAL: IntCounter = IntCounter::new(
        "botpanel_bot_reconnects_scheduled_total",
        "Automatic reconnects scheduled after a disconnect",
    )
    .unwrap();

    pub static ref CHAT_MESSAGES_RECEIVED_TOTAL: IntCounter = IntCounter::new(
        "botpanel_chat_messages_received_total",
        "Player chat lines seen by the bot",
    )
    .unwrap();

    pub static ref CHAT_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "botpanel_chat_messages_sent_total",
        "Chat lines sent on behalf of panel users",
    )
    .unwrap();

    /// Anti-idle ticks, by outcome (ok, skipped, error).
    pub static ref ANTI_IDLE_TICKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("botpanel_anti_idle_ticks_total", "Anti-idle ticks"),
        &["outcome"],
    )
    .unwrap();

    pub static ref WEBSOCKET_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "botpanel_websocket_messages_sent_total",
        "Total WebSocket messages sent to console observers",
    )
    .unwrap();

    pub static ref RELAY_LAGGED_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "botpanel_relay_lagged_events_total",
        "Events skipped by observers that fell behind",
    )
    .unwrap();

    pub static ref LOGIN_FAILURES_TOTAL: IntCounter =
        IntCounter::new("botpanel_login_failures_total", "Rejected panel logins").unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("botpanel_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "botpanel_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BOT_ONLINE.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(BOT_CONNECT_ATTEMPTS_TOTAL.clone()),
        Box::new(BOT_DISCONNECTS_TOTAL.clone()),
        Box::new(BOT_KICKS_TOTAL.clone()),
        Box::new(BOT_RECONNECTS_SCHEDULED_TOTAL.clone()),
        Box::new(CHAT_MESSAGES_RECEIVED_TOTAL.clone()),
        Box::new(CHAT_MESSAGES_SENT_TOTAL.clone()),
        Box::new(ANTI_IDLE_TICKS_TOTAL.clone()),
        Box::new(WEBSOCKET_MESSAGES_SENT_TOTAL.clone()),
        Box::new(RELAY_LAGGED_EVENTS_TOTAL.clone()),
        Box::new(LOGIN_FAILURES_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("metric already registered: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: the user name in `/api/users/<name>/...`
/// becomes `:username` so every account does not get its own series.
pub fn normalize_path(path: &str) -> String {
    let mut out = Vec::new();
    let mut after_users = false;
    for segment in path.split('/') {
        if after_users && !segment.is_empty() {
            out.push(":username");
            after_users = false;
            continue;
        }
        after_users = segment == "users";
        out.push(segment);
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_no_names() {
        assert_eq!(normalize_path("/api/users"), "/api/users");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/api/start"), "/api/start");
    }

    #[test]
    fn test_normalize_path_with_names() {
        assert_eq!(normalize_path("/api/users/Alice"), "/api/users/:username");
        assert_eq!(
            normalize_path("/api/users/E.Crafters/permissions"),
            "/api/users/:username/permissions"
        );
    }

    #[test]
    fn test_register_twice_does_not_panic() {
        register_metrics();
        register_metrics();
        let output = gather_metrics();
        assert!(output.is_empty() || output.contains("botpanel_"));
    }

    #[test]
    fn test_metric_increments() {
        BOT_ONLINE.set(1);
        assert_eq!(BOT_ONLINE.get(), 1);
        BOT_ONLINE.set(0);
        assert_eq!(BOT_ONLINE.get(), 0);

        CONNECTED_WEBSOCKETS.inc();
        CONNECTED_WEBSOCKETS.dec();

        ANTI_IDLE_TICKS_TOTAL.with_label_values(&["ok"]).inc();
        API_REQUESTS_TOTAL
            .with_label_values(&["POST", "/api/start", "200"])
            .inc();
        API_REQUEST_DURATION_SECONDS
            .with_label_values(&["/api/start"])
            .observe(0.01);
    }
}
