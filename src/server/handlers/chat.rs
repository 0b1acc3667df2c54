use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream};

use crate::chat::{ChatInput, ChatTurn, StreamEvent};
use crate::core::errors::ApiError;
use crate::state::AppState;

/// Streams one chat turn as server-sent events, one JSON frame per event.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ChatInput>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = state.chat.start_turn(input).await?;
    Ok(sse_response(turn))
}

/// Dropping the response body (client gone) drops the turn, which cancels it.
pub fn sse_response(turn: ChatTurn) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = stream::unfold(turn, |mut turn| async move {
        let event = turn.next().await?;
        Some((Ok(frame(&event)), turn))
    });
    Sse::new(frames).keep_alive(KeepAlive::default())
}

fn frame(event: &StreamEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!("Failed to encode stream frame: {}", err);
            Event::default().data(r#"{"type":"error","error":"encoding failed","code":"internal"}"#)
        }
    }
}
