// Event relay: fans bot events out to every connected console observer and
// keeps a bounded log history for late joiners.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::metrics;

/// Default number of log entries kept for late-joining observers.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Per-observer buffer. An observer that falls further behind than this skips events.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    /// A player chat line, mirrored into the log.
    Chat,
    /// A raw server message.
    Message,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Chat => "chat",
            LogLevel::Message => "message",
        };
        f.write_str(name)
    }
}

/// One console log line. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub level: LogLevel,
    pub msg: String,
}

impl LogEntry {
    pub fn now(level: LogLevel, msg: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            level,
            msg: msg.into(),
        }
    }
}

/// Connection status as reported to observers and the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotStatus {
    pub online: bool,
    /// In-game name, known once the bot has spawned.
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub username: String,
    pub message: String,
    pub ts: i64,
}

/// Messages pushed to console observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BotEvent {
    #[serde(rename = "bot-log")]
    Log(LogEntry),
    #[serde(rename = "bot-status")]
    Status(BotStatus),
    #[serde(rename = "bot-chat")]
    Chat(ChatEvent),
    /// Buffered history, sent once to a newly connected observer.
    #[serde(rename = "bot-log-init")]
    LogInit { entries: Vec<LogEntry> },
}

/// Publish/subscribe hub between the bot manager and console observers.
///
/// Publishing never waits on observers: each one has its own bounded buffer and
/// a slow observer only loses its own oldest events.
#[derive(Clone)]
pub struct EventRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    tx: broadcast::Sender<BotEvent>,
    history: Mutex<History>,
}

struct History {
    entries: VecDeque<LogEntry>,
    limit: usize,
}

impl History {
    fn push(&mut self, entry: LogEntry) {
        if self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

impl EventRelay {
    pub fn new(history_limit: usize) -> Self {
        Self::with_history(history_limit, Vec::new())
    }

    /// Create a relay seeded with previously persisted entries. Only the newest
    /// `history_limit` entries are kept.
    pub fn with_history(history_limit: usize, entries: Vec<LogEntry>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut history = History {
            entries: VecDeque::with_capacity(history_limit.min(1024)),
            limit: history_limit,
        };
        for entry in entries {
            history.push(entry);
        }
        Self {
            inner: Arc::new(RelayInner {
                tx,
                history: Mutex::new(history),
            }),
        }
    }

    /// Fan an event out to all current observers. Log entries are also
    /// appended to the history.
    pub fn publish(&self, event: BotEvent) {
        // Holding the history lock across the send keeps history and live
        // stream consistent for observers subscribing concurrently.
        let mut history = self.lock_history();
        if let BotEvent::Log(entry) = &event {
            history.push(entry.clone());
        }
        // Err only means nobody is listening.
        let _ = self.inner.tx.send(event);
    }

    /// Register a new observer. The returned subscription yields the given
    /// status snapshot, then the buffered history (if any), then live events.
    pub fn subscribe(&self, status: BotStatus) -> Subscription {
        let history = self.lock_history();
        let rx = self.inner.tx.subscribe();
        let mut bootstrap = VecDeque::with_capacity(2);
        bootstrap.push_back(BotEvent::Status(status));
        if !history.entries.is_empty() {
            bootstrap.push_back(BotEvent::LogInit {
                entries: history.entries.iter().cloned().collect(),
            });
        }
        Subscription { bootstrap, rx }
    }

    /// Snapshot of the buffered log history, oldest first.
    pub fn history(&self) -> Vec<LogEntry> {
        self.lock_history().entries.iter().cloned().collect()
    }

    /// Number of currently subscribed observers.
    pub fn observer_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Write the buffered history to `path` as a JSON array.
    pub fn save_history(&self, path: &Path) -> std::io::Result<()> {
        let entries = self.history();
        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, History> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Load persisted history. A missing or unreadable file yields an empty history.
pub fn load_history(path: &Path) -> Vec<LogEntry> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "Failed to read log history: {e}");
            }
            return Vec::new();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Ignoring corrupt log history: {e}");
            Vec::new()
        }
    }
}

/// One observer's view of the event stream.
pub struct Subscription {
    bootstrap: VecDeque<BotEvent>,
    rx: broadcast::Receiver<BotEvent>,
}

impl Subscription {
    /// Next event for this observer, or `None` once the relay is gone.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<BotEvent> {
        if let Some(event) = self.bootstrap.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Console observer lagged, skipped {n} events");
                    metrics::RELAY_LAGGED_EVENTS_TOTAL.inc_by(n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv); `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<BotEvent> {
        if let Some(event) = self.bootstrap.pop_front() {
            return Some(event);
        }
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    metrics::RELAY_LAGGED_EVENTS_TOTAL.inc_by(n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<BotEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
