use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::server::handlers::{bots, chat, config, health, knowledge, rules, sessions};
use crate::server::ws::handler::ws_handler;
use crate::state::AppState;

/// Creates the application router: health, config, knowledge, coding rules,
/// bots, sessions, chat (SSE) and the WebSocket endpoint, behind CORS and
/// request tracing.
pub fn router(state: Arc<AppState>) -> Router {
    let cors_layer = build_cors_layer(&state.settings.server.allowed_origins);
    Router::new()
        .route("/health", get(health::health))
        .route("/api/health", get(health::get_health))
        .route(
            "/api/config",
            get(config::get_config)
                .put(config::update_config)
                .patch(config::patch_config),
        )
        .route(
            "/api/knowledge",
            get(knowledge::list_items)
                .post(knowledge::create_item)
                .delete(knowledge::reset),
        )
        .route("/api/knowledge/search", post(knowledge::search))
        .route("/api/knowledge/batch-delete", post(knowledge::batch_delete))
        .route("/api/knowledge/stats", get(knowledge::stats))
        .route("/api/knowledge/categories", get(knowledge::categories))
        .route(
            "/api/knowledge/:item_id",
            get(knowledge::get_item)
                .put(knowledge::update_item)
                .delete(knowledge::delete_item),
        )
        .route(
            "/api/coding-rules",
            get(rules::list_rules).post(rules::create_rule),
        )
        .route("/api/coding-rules/search", post(rules::search))
        .route("/api/coding-rules/apply", post(rules::apply))
        .route("/api/coding-rules/stats", get(rules::stats))
        .route("/api/coding-rules/categories", get(rules::categories))
        .route("/api/coding-rules/languages", get(rules::languages))
        .route(
            "/api/coding-rules/:rule_id",
            get(rules::get_rule)
                .put(rules::update_rule)
                .delete(rules::delete_rule),
        )
        .route("/api/bots", get(bots::list_bots).post(bots::create_bot))
        .route("/api/bots/stats", get(bots::stats))
        .route(
            "/api/bots/:bot_id",
            get(bots::get_bot)
                .put(bots::update_bot)
                .delete(bots::delete_bot),
        )
        .route("/api/bots/:bot_id/chat", post(bots::chat))
        .route(
            "/api/sessions",
            get(sessions::list_sessions)
                .post(sessions::create_session)
                .delete(sessions::clear_sessions),
        )
        .route("/api/sessions/recent", get(sessions::recent_session))
        .route(
            "/api/sessions/:session_id",
            get(sessions::get_session)
                .patch(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route(
            "/api/sessions/:session_id/messages",
            get(sessions::get_session_messages),
        )
        .route("/api/chat", post(chat::chat))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer(configured: &[String]) -> CorsLayer {
    let origins = resolve_allowed_origins(configured);
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect::<Vec<_>>(),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn resolve_allowed_origins(configured: &[String]) -> Vec<String> {
    let origins: Vec<String> = configured
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();

    if origins.is_empty() {
        return default_local_origins();
    }
    origins
}

fn default_local_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
        "http://127.0.0.1".to_string(),
        "http://127.0.0.1:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
        "http://127.0.0.1:8000".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_origin_list_falls_back_to_local_hosts() {
        let origins = resolve_allowed_origins(&["  ".to_string()]);
        assert!(origins.contains(&"http://localhost:3000".to_string()));

        let configured = resolve_allowed_origins(&["https://shop.example".to_string()]);
        assert_eq!(configured, vec!["https://shop.example".to_string()]);
    }
}
