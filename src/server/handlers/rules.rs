use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::chat::EngineConfig;
use crate::core::errors::ApiError;
use crate::rules::{apply_rule, RuleDraft, RuleFilter, RulePatch};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub category: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: usize,
}

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub rule_id: String,
    pub text: String,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = RuleFilter {
        category: query.category,
        language: query.language,
    };
    Ok(Json(state.rules.list(query.page, query.page_size, &filter)?))
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<RuleDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.rules.create(draft)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rules.resolve(&rule_id)?))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
    Json(patch): Json<RulePatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rules.update(&rule_id, patch)?))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.rules.delete(&rule_id)?;
    Ok(Json(json!({"deleted": rule_id})))
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.rules.search(&payload.query, payload.top_k)?))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.rules.stats())
}

pub async fn categories(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"categories": state.rules.categories()}))
}

pub async fn languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({"languages": state.rules.languages()}))
}

/// Asks the chat model to rewrite `text` under one stored rule.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ApplyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rule = state.rules.resolve(&payload.rule_id)?;
    let reasoning = EngineConfig::from(&state.settings.chat);
    let outcome = apply_rule(state.generation.as_ref(), &rule, &payload.text, &reasoning).await?;
    Ok(Json(outcome))
}
