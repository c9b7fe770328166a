// WebSocket handler for the live bot console.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::auth::Permission;
use crate::metrics;
use crate::relay::BotEvent;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Session token. Watching the console needs none; sending chat does.
    pub token: Option<String>,
}

/// Messages a console observer may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ObserverCommand {
    #[serde(rename = "send-message")]
    SendMessage { text: String },
}

/// WebSocket upgrade handler for the console stream.
pub async fn ws_console(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, params.token))
}

async fn handle_ws(socket: WebSocket, state: AppState, token: Option<String>) {
    let observer = Uuid::new_v4();
    let username = token
        .as_deref()
        .and_then(|t| state.sessions.get(t))
        .map(|s| s.username);
    tracing::info!(%observer, ?username, "Console observer connected");
    metrics::CONNECTED_WEBSOCKETS.inc();

    let (mut sender, mut receiver) = socket.split();
    // Status snapshot and history come first, then live events.
    let mut events = state.bot.observe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(frame) = encode_frame(&event) else {
                    continue;
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
                metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_command(&state, token.as_deref(), observer, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%observer, "WebSocket receive error: {e}");
                        break;
                    }
                    // Pings are answered by axum; binary frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
    tracing::info!(%observer, "Console observer disconnected");
}

fn encode_frame(event: &BotEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!("Failed to encode console event: {e}");
            None
        }
    }
}

fn handle_command(state: &AppState, token: Option<&str>, observer: Uuid, text: &str) {
    let command = match serde_json::from_str::<ObserverCommand>(text) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(%observer, "Ignoring malformed console message: {e}");
            return;
        }
    };
    match command {
        ObserverCommand::SendMessage { text } => {
            // Looked up per message so revocations and permission changes apply.
            let allowed = token
                .and_then(|t| state.sessions.get(t))
                .is_some_and(|s| s.has(Permission::SendMessage));
            if !allowed {
                tracing::warn!(%observer, "Console chat rejected: no send_message permission");
                return;
            }
            state.bot.send_message(&text);
        }
    }
}
