// Bot lifecycle: the game client seam, the TCP bridge implementation of it,
// and the manager that owns the single connection.

pub mod bridge;
pub mod client;
pub mod manager;

pub use client::{ClientError, Connection, ConnectOptions, Connector, Control, GameEvent, GameHandle, Position};
pub use manager::{BotManager, BotSettings, Phase, Timings};
