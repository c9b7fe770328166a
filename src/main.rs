use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use botpanel_backend::api::{self, AppState};
use botpanel_backend::bot::bridge::BridgeConnector;
use botpanel_backend::bot::BotManager;
use botpanel_backend::config::{BotConfig, Config};
use botpanel_backend::metrics;
use botpanel_backend::relay::{self, EventRelay};
use botpanel_backend::users::{UserStore, PROTECTED_USER};

const QUIT_FLUSH_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    metrics::register_metrics();

    let config = Config::load();
    let bot_config = BotConfig::load(&config.bot_config_path);

    let history = relay::load_history(&config.log_history_path);
    let relay = EventRelay::with_history(config.log_history_limit, history);
    let connector = Arc::new(BridgeConnector::new(bot_config.bridge.addr.clone()));
    let bot = BotManager::new(bot_config.settings(), connector, relay);

    let users = UserStore::open(&config.users_path);
    if let Some(password) = &config.admin_password {
        match users.seed_admin(password) {
            Ok(true) => tracing::info!("Created {PROTECTED_USER} account"),
            Ok(false) => {}
            Err(e) => tracing::error!("Failed to seed {PROTECTED_USER}: {e}"),
        }
    }

    let static_dir = config.static_dir.is_dir().then(|| config.static_dir.clone());
    if static_dir.is_none() {
        tracing::warn!(dir = %config.static_dir.display(), "Static directory missing, UI disabled");
    }
    let app = api::router(AppState::new(bot.clone(), users), static_dir);

    if config.auto_start {
        bot.start();
    }

    let addr = SocketAddr::new(config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Bot panel listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    // Give the bridge task time to deliver the quit before the runtime goes away.
    bot.stop();
    tokio::time::sleep(QUIT_FLUSH_GRACE).await;
    match bot.relay().save_history(&config.log_history_path) {
        Ok(()) => tracing::info!(path = %config.log_history_path.display(), "Saved log history"),
        Err(e) => tracing::error!("Failed to save log history: {e}"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
