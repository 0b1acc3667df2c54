use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Reachability of the model server plus what the pipeline is configured with.
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reachable = match state.generation.health_check().await {
        Ok(ok) => ok,
        Err(err) => {
            tracing::debug!("Model server health check failed: {}", err);
            false
        }
    };
    let available_models = if reachable {
        state.generation.list_models().await.unwrap_or_else(|err| {
            tracing::debug!("Listing models failed: {}", err);
            Vec::new()
        })
    } else {
        Vec::new()
    };
    Json(json!({
        "status": if reachable { "ok" } else { "degraded" },
        "provider": state.generation.name(),
        "chat_model": state.generation.model(),
        "embedding_model": state.embedding.model(),
        "model_server_reachable": reachable,
        "available_models": available_models,
        "sessions_persistent": state.sessions.is_persistent(),
    }))
}
