// Game client bridge: talks to a sidecar process that embeds the actual game
// client library, using newline-delimited JSON over TCP.
//
// Commands (panel → bridge) and events (bridge → panel) are tagged by `op`:
//   {"op":"connect","host":"mc.example.net","port":25565,...}
//   {"op":"spawn","username":"PanelBot","position":{"x":0.5,"y":64.0,"z":0.5}}

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::client::{
    ClientError, Connection, ConnectOptions, Connector, Control, GameEvent, GameHandle, Position,
};

/// Default address of the bridge sidecar.
pub const DEFAULT_BRIDGE_ADDR: &str = "127.0.0.1:3001";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeCommand {
    Connect {
        host: String,
        port: u16,
        username: String,
        password: Option<String>,
        auth: String,
        version: String,
    },
    Chat {
        text: String,
    },
    LookAt {
        x: f64,
        y: f64,
        z: f64,
    },
    SetControlState {
        control: Control,
        state: bool,
    },
    Quit {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeEvent {
    Spawn {
        username: String,
        #[serde(default)]
        position: Option<Position>,
    },
    Position {
        x: f64,
        y: f64,
        z: f64,
    },
    Chat {
        username: String,
        message: String,
    },
    Message {
        text: String,
    },
    Kicked {
        reason: String,
    },
    Error {
        message: String,
    },
    End {},
}

/// Connector backed by the bridge sidecar at `addr`.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    addr: String,
}

impl BridgeConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for BridgeConnector {
    fn connect(&self, opts: &ConnectOptions) -> Result<Connection, ClientError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let position = Arc::new(Mutex::new(None));

        let hello = BridgeCommand::Connect {
            host: opts.host.clone(),
            port: opts.port,
            username: opts.username.clone(),
            password: opts.password.clone(),
            auth: opts.auth.clone(),
            version: opts.version.clone(),
        };
        tokio::spawn(run_bridge(
            self.addr.clone(),
            hello,
            cmd_rx,
            event_tx,
            position.clone(),
        ));

        Ok(Connection {
            handle: Arc::new(BridgeHandle {
                commands: cmd_tx,
                position,
            }),
            events: event_rx,
        })
    }
}

struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    position: Arc<Mutex<Option<Position>>>,
}

impl BridgeHandle {
    fn send(&self, cmd: BridgeCommand) -> Result<(), ClientError> {
        self.commands.send(cmd).map_err(|_| ClientError::Closed)
    }
}

impl GameHandle for BridgeHandle {
    fn position(&self) -> Option<Position> {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chat(&self, text: &str) -> Result<(), ClientError> {
        self.send(BridgeCommand::Chat {
            text: text.to_string(),
        })
    }

    fn look_at(&self, target: Position) -> Result<(), ClientError> {
        self.send(BridgeCommand::LookAt {
            x: target.x,
            y: target.y,
            z: target.z,
        })
    }

    fn set_control_state(&self, control: Control, active: bool) -> Result<(), ClientError> {
        self.send(BridgeCommand::SetControlState {
            control,
            state: active,
        })
    }

    fn quit(&self, reason: &str) -> Result<(), ClientError> {
        self.send(BridgeCommand::Quit {
            reason: reason.to_string(),
        })
    }
}

/// Connection task. Always finishes by emitting `End`, preceded by `Error`
/// when the bridge failed.
async fn run_bridge(
    addr: String,
    hello: BridgeCommand,
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
    events: mpsc::UnboundedSender<GameEvent>,
    position: Arc<Mutex<Option<Position>>>,
) {
    if let Err(e) = drive(&addr, hello, commands, &events, &position).await {
        tracing::warn!(%addr, "game bridge failed: {e}");
        let _ = events.send(GameEvent::Error {
            message: e.to_string(),
        });
    }
    *position.lock().unwrap_or_else(PoisonError::into_inner) = None;
    let _ = events.send(GameEvent::End);
}

async fn drive(
    addr: &str,
    hello: BridgeCommand,
    mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    events: &mpsc::UnboundedSender<GameEvent>,
    position: &Mutex<Option<Position>>,
) -> Result<(), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connect(format!("{addr}: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_command(&mut write_half, &hello).await?;
    tracing::debug!(%addr, "game bridge connected");

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                // The handle was dropped: the manager has let go of this connection.
                let Some(cmd) = cmd else { return Ok(()); };
                write_command(&mut write_half, &cmd).await?;
            }
            line = lines.next_line() => {
                let line = line.map_err(|e| ClientError::Protocol(e.to_string()))?;
                let Some(line) = line else { return Ok(()); };
                if line.trim().is_empty() {
                    continue;
                }
                let event = match serde_json::from_str::<BridgeEvent>(&line) {
                    Ok(ev) => ev,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed bridge line: {e}");
                        continue;
                    }
                };
                if let Some(game_event) = translate(event, position) {
                    let ended = game_event == GameEvent::End;
                    if ended {
                        return Ok(());
                    }
                    if events.send(game_event).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Map a bridge event onto a game event, tracking position on the way.
fn translate(event: BridgeEvent, position: &Mutex<Option<Position>>) -> Option<GameEvent> {
    let mut pos = position.lock().unwrap_or_else(PoisonError::into_inner);
    match event {
        BridgeEvent::Spawn {
            username,
            position: spawn_pos,
        } => {
            if spawn_pos.is_some() {
                *pos = spawn_pos;
            }
            Some(GameEvent::Spawn { username })
        }
        BridgeEvent::Position { x, y, z } => {
            *pos = Some(Position::new(x, y, z));
            None
        }
        BridgeEvent::Chat { username, message } => Some(GameEvent::Chat { username, message }),
        BridgeEvent::Message { text } => Some(GameEvent::Message { text }),
        BridgeEvent::Kicked { reason } => Some(GameEvent::Kicked { reason }),
        BridgeEvent::Error { message } => Some(GameEvent::Error { message }),
        BridgeEvent::End {} => Some(GameEvent::End),
    }
}

async fn write_command(
    writer: &mut OwnedWriteHalf,
    cmd: &BridgeCommand,
) -> Result<(), ClientError> {
    let mut line =
        serde_json::to_string(cmd).map_err(|e| ClientError::Protocol(e.to_string()))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ClientError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn opts() -> ConnectOptions {
        ConnectOptions {
            host: "mc.example.net".into(),
            port: 25565,
            username: "PanelBot".into(),
            password: Some("hunter22".into()),
            auth: "offline".into(),
            version: "1.20.4".into(),
        }
    }

    #[test]
    fn test_command_wire_format() {
        let json = serde_json::to_value(BridgeCommand::SetControlState {
            control: Control::Jump,
            state: true,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"op": "set_control_state", "control": "jump", "state": true})
        );
    }

    #[test]
    fn test_translate_tracks_position() {
        let position = Mutex::new(None);
        let ev = translate(
            BridgeEvent::Spawn {
                username: "PanelBot".into(),
                position: Some(Position::new(1.0, 64.0, 2.0)),
            },
            &position,
        );
        assert_eq!(
            ev,
            Some(GameEvent::Spawn {
                username: "PanelBot".into()
            })
        );
        assert_eq!(*position.lock().unwrap(), Some(Position::new(1.0, 64.0, 2.0)));

        assert!(translate(BridgeEvent::Position { x: 3.0, y: 65.0, z: 4.0 }, &position).is_none());
        assert_eq!(*position.lock().unwrap(), Some(Position::new(3.0, 65.0, 4.0)));
    }

    #[tokio::test]
    async fn test_bridge_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let sidecar = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let hello: BridgeCommand =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert!(matches!(hello, BridgeCommand::Connect { ref host, port: 25565, .. } if host == "mc.example.net"));

            write_half
                .write_all(b"{\"op\":\"spawn\",\"username\":\"PanelBot\",\"position\":{\"x\":0.5,\"y\":64.0,\"z\":0.5}}\n")
                .await
                .unwrap();
            write_half
                .write_all(b"{\"op\":\"chat\",\"username\":\"Alice\",\"message\":\"hello\"}\n")
                .await
                .unwrap();

            let chat: BridgeCommand =
                serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(chat, BridgeCommand::Chat { text: "hi Alice".into() });

            write_half
                .write_all(b"{\"op\":\"kicked\",\"reason\":\"bye\"}\n{\"op\":\"end\"}\n")
                .await
                .unwrap();
        });

        let Connection { handle, mut events } = BridgeConnector::new(addr).connect(&opts()).unwrap();

        assert_eq!(
            events.recv().await,
            Some(GameEvent::Spawn {
                username: "PanelBot".into()
            })
        );
        assert_eq!(handle.position(), Some(Position::new(0.5, 64.0, 0.5)));
        assert_eq!(
            events.recv().await,
            Some(GameEvent::Chat {
                username: "Alice".into(),
                message: "hello".into()
            })
        );

        handle.chat("hi Alice").unwrap();

        assert_eq!(
            events.recv().await,
            Some(GameEvent::Kicked {
                reason: "bye".into()
            })
        );
        assert_eq!(events.recv().await, Some(GameEvent::End));
        assert_eq!(handle.position(), None);
        sidecar.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_bridge_reports_error_then_end() {
        // Bind and drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let Connection { handle, mut events } = BridgeConnector::new(addr).connect(&opts()).unwrap();

        assert!(matches!(events.recv().await, Some(GameEvent::Error { .. })));
        assert_eq!(events.recv().await, Some(GameEvent::End));
        assert!(events.recv().await.is_none());
        assert!(handle.chat("anyone?").is_err());
    }

    #[tokio::test]
    async fn test_quit_reaches_bridge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let Connection { handle, mut events } = BridgeConnector::new(addr).connect(&opts()).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        let hello: BridgeCommand =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(hello, BridgeCommand::Connect { .. }));

        handle.quit("Shutting down (panel)").unwrap();
        let quit: BridgeCommand =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            quit,
            BridgeCommand::Quit {
                reason: "Shutting down (panel)".into()
            }
        );

        // Closing the sidecar side ends the connection.
        drop(lines);
        assert_eq!(events.recv().await, Some(GameEvent::End));
    }
}
