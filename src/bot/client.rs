// Game client capability: the seam between the lifecycle manager and whatever
// actually speaks the game protocol.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A point in the game world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Return a new position shifted by the given deltas.
    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }
}

/// Movement controls the client can hold down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Forward,
    Back,
    Left,
    Right,
    Jump,
    Sprint,
    Sneak,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Control::Forward => "forward",
            Control::Back => "back",
            Control::Left => "left",
            Control::Right => "right",
            Control::Jump => "jump",
            Control::Sprint => "sprint",
            Control::Sneak => "sneak",
        };
        f.write_str(name)
    }
}

/// Lifecycle and chat events raised by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// The client entered the world under the given name.
    Spawn { username: String },
    /// A player chat line.
    Chat { username: String, message: String },
    /// Any other server message, already rendered to plain text.
    Message { text: String },
    /// The server kicked the client. `End` follows.
    Kicked { reason: String },
    /// A connection-level error. Fatal errors are followed by `End`.
    Error { message: String },
    /// The connection is gone, for whatever reason.
    End,
}

/// Everything needed to open a connection to the game server.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Authentication mode understood by the client library (`offline`, `microsoft`, ...).
    pub auth: String,
    /// Protocol version string, e.g. `1.20.4`.
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection closed")]
    Closed,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("bridge protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Rejected(String),
}

/// A live connection. Every method is non-blocking: commands are queued to the
/// connection's own I/O task.
pub trait GameHandle: Send + Sync {
    /// Current position of the client's entity, `None` until it has spawned.
    fn position(&self) -> Option<Position>;
    fn chat(&self, text: &str) -> Result<(), ClientError>;
    fn look_at(&self, target: Position) -> Result<(), ClientError>;
    fn set_control_state(&self, control: Control, active: bool) -> Result<(), ClientError>;
    fn quit(&self, reason: &str) -> Result<(), ClientError>;
}

/// A freshly requested connection: the command handle plus its event stream.
pub struct Connection {
    pub handle: Arc<dyn GameHandle>,
    pub events: mpsc::UnboundedReceiver<GameEvent>,
}

/// Opens connections. `connect` must return immediately; the handshake happens
/// in the background and its outcome arrives as events.
pub trait Connector: Send + Sync {
    fn connect(&self, opts: &ConnectOptions) -> Result<Connection, ClientError>;
}
