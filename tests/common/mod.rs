// Shared fixtures for the integration tests: a scripted in-memory game client.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use botpanel_backend::bot::{
    BotManager, BotSettings, ClientError, Connection, ConnectOptions, Connector, Control,
    GameEvent, GameHandle, Position, Timings,
};
use botpanel_backend::relay::{BotEvent, EventRelay, LogEntry};

/// Something the manager asked a mock connection to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Chat(String),
    LookAt(Position),
    Control(Control, bool),
    Quit(String),
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    position: Mutex<Option<Position>>,
    chat_fails: AtomicBool,
    connect_fails: AtomicBool,
    connections: Mutex<Vec<mpsc::UnboundedSender<GameEvent>>>,
}

/// Connector whose connections do nothing on their own. Tests drive them by
/// pushing events and inspect what the manager asked for.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `connect` calls so far.
    pub fn connects(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Push an event on the most recent connection.
    pub fn emit(&self, event: GameEvent) {
        let connections = self.shared.connections.lock().unwrap();
        let tx = connections.last().expect("no connection yet");
        let _ = tx.send(event);
    }

    /// Push an event on the `index`th connection (0-based).
    pub fn emit_on(&self, index: usize, event: GameEvent) {
        let connections = self.shared.connections.lock().unwrap();
        let _ = connections[index].send(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn chats(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Chat(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().unwrap().clear();
    }

    pub fn set_position(&self, position: Option<Position>) {
        *self.shared.position.lock().unwrap() = position;
    }

    pub fn set_chat_fails(&self, fails: bool) {
        self.shared.chat_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.shared.connect_fails.store(fails, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(&self, _opts: &ConnectOptions) -> Result<Connection, ClientError> {
        if self.shared.connect_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Connect("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.connections.lock().unwrap().push(tx);
        Ok(Connection {
            handle: Arc::new(MockHandle {
                shared: self.shared.clone(),
            }),
            events: rx,
        })
    }
}

struct MockHandle {
    shared: Arc<Shared>,
}

impl MockHandle {
    fn record(&self, call: Call) {
        self.shared.calls.lock().unwrap().push(call);
    }
}

impl GameHandle for MockHandle {
    fn position(&self) -> Option<Position> {
        *self.shared.position.lock().unwrap()
    }

    fn chat(&self, text: &str) -> Result<(), ClientError> {
        self.record(Call::Chat(text.to_string()));
        if self.shared.chat_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("chat refused".into()));
        }
        Ok(())
    }

    fn look_at(&self, target: Position) -> Result<(), ClientError> {
        self.record(Call::LookAt(target));
        Ok(())
    }

    fn set_control_state(&self, control: Control, active: bool) -> Result<(), ClientError> {
        self.record(Call::Control(control, active));
        Ok(())
    }

    fn quit(&self, reason: &str) -> Result<(), ClientError> {
        self.record(Call::Quit(reason.to_string()));
        Ok(())
    }
}

pub fn settings(password: Option<&str>) -> BotSettings {
    BotSettings {
        connect: ConnectOptions {
            host: "mc.test".into(),
            port: 25565,
            username: "PanelBot".into(),
            password: password.map(str::to_string),
            auth: "offline".into(),
            version: "1.20.4".into(),
        },
        login_commands: vec![
            "/register {password} {password}".into(),
            "/login {password}".into(),
        ],
        timings: Timings::default(),
    }
}

/// A manager wired to a fresh mock client and relay.
pub fn manager_with(settings: BotSettings) -> (BotManager, MockConnector) {
    let client = MockConnector::new();
    let manager = BotManager::new(settings, Arc::new(client.clone()), EventRelay::new(200));
    (manager, client)
}

pub fn manager() -> (BotManager, MockConnector) {
    manager_with(settings(Some("hunter2")))
}

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Advance paused time and let the woken tasks run.
pub async fn advance(duration: std::time::Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

pub fn log_messages(manager: &BotManager) -> Vec<String> {
    manager
        .relay()
        .history()
        .into_iter()
        .map(|e: LogEntry| e.msg)
        .collect()
}

pub fn count_logs(manager: &BotManager, msg: &str) -> usize {
    log_messages(manager).iter().filter(|m| *m == msg).count()
}

pub fn is_log(event: &BotEvent, prefix: &str) -> bool {
    matches!(event, BotEvent::Log(entry) if entry.msg.starts_with(prefix))
}
