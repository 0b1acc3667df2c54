use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::chat::sse_response;
use crate::bots::{BotDraft, BotPatch, BotView};
use crate::chat::ChatInput;
use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct BotChatRequest {
    #[serde(flatten)]
    pub input: ChatInput,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

fn default_stream() -> bool {
    true
}

pub async fn list_bots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.bots.list(query.page, query.page_size)?))
}

pub async fn create_bot(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<BotDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let bot = state.bots.create(draft)?;
    Ok((StatusCode::CREATED, Json(BotView::from(bot))))
}

pub async fn get_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(BotView::from(state.bots.resolve(&bot_id)?)))
}

pub async fn update_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(patch): Json<BotPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(BotView::from(state.bots.update(&bot_id, patch)?)))
}

pub async fn delete_bot(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.bots.delete(&bot_id)?;
    Ok(Json(json!({"deleted": bot_id})))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bots.stats())
}

/// Chat with one bot; SSE unless the request sets `"stream": false`.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(payload): Json<BotChatRequest>,
) -> Result<Response, ApiError> {
    let mut input = payload.input;
    input.bot_id = Some(bot_id);

    if payload.stream {
        let turn = state.chat.start_turn(input).await?;
        Ok(sse_response(turn).into_response())
    } else {
        let answer = state.chat.answer(input).await?;
        Ok(Json(answer).into_response())
    }
}
