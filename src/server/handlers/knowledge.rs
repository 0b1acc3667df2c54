use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::rag::{KnowledgeDraft, KnowledgePatch};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub ids: Vec<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .knowledge
        .list(query.category.as_deref(), query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<KnowledgeDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.knowledge.create(draft).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.knowledge.get(&item_id).await?))
}

pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
    Json(patch): Json<KnowledgePatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.knowledge.update(&item_id, patch).await?))
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.knowledge.delete(&item_id).await?;
    Ok(Json(json!({"deleted": deleted})))
}

pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.knowledge.batch_delete(&payload.ids).await?;
    Ok(Json(json!({"deleted": deleted, "requested": payload.ids.len()})))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let top_k = payload.top_k.unwrap_or(state.settings.retrieval.top_k);
    Ok(Json(state.knowledge.search(&payload.query, top_k).await?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.knowledge.stats().await?))
}

pub async fn categories(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({"categories": state.knowledge.categories().await?})))
}

pub async fn reset(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.knowledge.reset().await?;
    Ok(Json(json!({"status": "cleared"})))
}
