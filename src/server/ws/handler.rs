use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::protocol::WsIncomingMessage;
use crate::chat::CancelHandle;
use crate::core::errors::ApiError;
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// A frame on its way to the socket. Stream frames carry the turn that
/// produced them; control frames carry none and are always written.
struct Outbound {
    turn: Option<u64>,
    frame: Value,
}

impl Outbound {
    fn control(frame: Value) -> Self {
        Self { turn: None, frame }
    }

    fn stream(turn: u64, frame: Value) -> Self {
        Self {
            turn: Some(turn),
            frame,
        }
    }
}

/// Current turn of a connection. Stopping or replacing a turn advances it,
/// and the writer drops frames tagged with an older turn.
#[derive(Clone, Default)]
struct TurnGate(Arc<AtomicU64>);

impl TurnGate {
    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn admits(&self, outbound: &Outbound) -> bool {
        outbound.turn.map_or(true, |turn| turn == self.current())
    }
}

/// Drains queued frames into the socket until either side closes.
async fn write_frames<S>(mut rx: mpsc::Receiver<Outbound>, gate: TurnGate, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(outbound) = rx.recv().await {
        if !gate.admits(&outbound) {
            continue;
        }
        if sink.send(Message::Text(outbound.frame.to_string())).await.is_err() {
            break;
        }
    }
}

/// Per-connection state. At most one turn streams at a time; a new chat
/// message replaces the running one.
struct Connection {
    state: Arc<AppState>,
    out: mpsc::Sender<Outbound>,
    gate: TurnGate,
    session_id: Option<String>,
    active: Option<CancelHandle>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let (out, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let gate = TurnGate::default();

    let writer = tokio::spawn(write_frames(out_rx, gate.clone(), sender));

    let mut conn = Connection {
        state,
        out,
        gate,
        session_id: None,
        active: None,
    };

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let incoming = match serde_json::from_str::<WsIncomingMessage>(&text) {
            Ok(incoming) => incoming,
            Err(err) => {
                conn.send(json!({"type": "error", "error": format!("invalid frame: {err}"), "code": "invalid_input"}))
                    .await;
                continue;
            }
        };
        if let Err(err) = conn.handle(incoming).await {
            conn.send(json!({"type": "error", "error": err.to_string(), "code": err.code()}))
                .await;
        }
    }

    conn.stop_active();
    drop(conn);
    let _ = writer.await;
}

impl Connection {
    async fn handle(&mut self, data: WsIncomingMessage) -> Result<(), ApiError> {
        match data.msg_type.as_deref().unwrap_or("chat") {
            "stop" => {
                self.stop_active();
                self.send(json!({"type": "stopped"})).await;
                Ok(())
            }
            "set_session" => self.set_session(data).await,
            "chat" => self.chat(data).await,
            other => Err(ApiError::invalid(format!("unknown message type '{other}'"))),
        }
    }

    /// Resumes a stored session: replies with its history, plus the bot
    /// greeting when the session is still empty.
    async fn set_session(&mut self, data: WsIncomingMessage) -> Result<(), ApiError> {
        let session_id = match data.session_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => match self.state.sessions.most_recent().await {
                Some(id) => id,
                None => self.state.sessions.create(None).await?,
            },
        };
        let session = self.state.sessions.get(&session_id).await?;
        let bot = self.state.chat.resolve_bot(data.bot_id.as_deref())?;

        self.session_id = Some(session_id.clone());
        self.send(json!({"type": "session_changed", "session_id": session_id}))
            .await;
        let empty = session.messages.is_empty();
        self.send(json!({"type": "history", "session_id": session_id, "messages": session.messages}))
            .await;
        if empty {
            self.send(json!({"type": "greeting", "content": bot.greeting_message}))
                .await;
        }
        Ok(())
    }

    async fn chat(&mut self, data: WsIncomingMessage) -> Result<(), ApiError> {
        if data.message.as_deref().map_or(true, |m| m.trim().is_empty()) {
            return Err(ApiError::invalid("message must not be empty"));
        }

        let session_id = match data.session_id.clone().or_else(|| self.session_id.clone()) {
            Some(id) => id,
            None => {
                let id = self.state.sessions.create(None).await?;
                self.send(json!({"type": "session_changed", "session_id": id}))
                    .await;
                id
            }
        };
        self.session_id = Some(session_id.clone());

        self.stop_active();
        let mut turn = self
            .state
            .chat
            .start_turn(data.into_chat_input(Some(session_id)))
            .await?;
        self.active = Some(turn.cancel_handle());
        let turn_id = self.gate.current();

        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(event) = turn.next().await {
                let frame = match serde_json::to_value(&event) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::error!("Failed to encode stream frame: {}", err);
                        break;
                    }
                };
                if out.send(Outbound::stream(turn_id, frame)).await.is_err() {
                    turn.cancel();
                    break;
                }
            }
        });
        Ok(())
    }

    fn stop_active(&mut self) {
        self.gate.advance();
        if let Some(handle) = self.active.take() {
            handle.cancel();
        }
    }

    async fn send(&self, frame: Value) {
        let _ = self.out.send(Outbound::control(frame)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(written: &[Message]) -> Vec<String> {
        written
            .iter()
            .filter_map(|msg| match msg {
                Message::Text(text) => serde_json::from_str::<Value>(text).ok(),
                _ => None,
            })
            .map(|frame| frame["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn stopping_a_turn_invalidates_its_frames() {
        let gate = TurnGate::default();
        let turn = gate.advance();
        let chunk = Outbound::stream(turn, json!({"type": "chunk"}));
        assert!(gate.admits(&chunk));

        gate.advance();
        assert!(!gate.admits(&chunk));
        assert!(gate.admits(&Outbound::control(json!({"type": "stopped"}))));
    }

    #[tokio::test]
    async fn chunk_queued_after_stopped_is_not_written() {
        let gate = TurnGate::default();
        let (out, rx) = mpsc::channel(8);
        let first = gate.advance();
        out.send(Outbound::stream(first, json!({"type": "chunk", "text": "a"})))
            .await
            .unwrap();

        // A stop lands while the relay still holds the next chunk.
        gate.advance();
        out.send(Outbound::control(json!({"type": "stopped"}))).await.unwrap();
        out.send(Outbound::stream(first, json!({"type": "chunk", "text": "b"})))
            .await
            .unwrap();

        let second = gate.advance();
        out.send(Outbound::stream(second, json!({"type": "chunk", "text": "c"})))
            .await
            .unwrap();
        drop(out);

        let mut written = Vec::new();
        write_frames(rx, gate, &mut written).await;

        assert_eq!(kinds(&written), vec!["stopped", "chunk"]);
        match &written[1] {
            Message::Text(text) => assert!(text.contains("\"c\"")),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
