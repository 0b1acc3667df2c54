use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"sessions": state.sessions.list().await}))
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<CreateSessionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let session_id = state.sessions.create(payload.title).await?;
    let session = state.sessions.get(&session_id).await?;
    Ok((StatusCode::CREATED, Json(json!({"session": session}))))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({"session": state.sessions.get(&session_id).await?})))
}

pub async fn get_session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.get(&session_id).await?;
    let mut messages = session.messages;
    if let Some(limit) = query.limit {
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    Ok(Json(json!({"messages": messages})))
}

pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<UpdateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.rename(&session_id, &payload.title).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.delete(&session_id).await?;
    Ok(Json(json!({"success": true})))
}

pub async fn clear_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let removed = state.sessions.clear_all().await?;
    Ok(Json(json!({"removed": removed})))
}

/// Session a reloaded client should resume, if any.
pub async fn recent_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"session_id": state.sessions.most_recent().await}))
}
