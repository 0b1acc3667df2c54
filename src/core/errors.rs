use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("generation service unavailable: {0}")]
    GenerationUnavailable(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("bot not found: {0}")]
    BotNotFound(String),
    #[error("coding rule not found: {0}")]
    RuleNotFound(String),
    #[error("knowledge item not found: {0}")]
    ItemNotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::InvalidInput(message.into())
    }

    /// Stable machine-readable kind, used in HTTP bodies and stream frames.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::EmbeddingUnavailable(_) => "embedding_unavailable",
            ApiError::GenerationUnavailable(_) => "generation_unavailable",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::BotNotFound(_) => "bot_not_found",
            ApiError::RuleNotFound(_) => "rule_not_found",
            ApiError::ItemNotFound(_) => "item_not_found",
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::EmbeddingUnavailable(_) | ApiError::GenerationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::SessionNotFound(_)
            | ApiError::BotNotFound(_)
            | ApiError::RuleNotFound(_)
            | ApiError::ItemNotFound(_)
            | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("database error: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        }
        let body = Json(json!({ "error": self.to_string(), "code": self.code() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_kinds_map_to_404() {
        for err in [
            ApiError::SessionNotFound("s".into()),
            ApiError::BotNotFound("b".into()),
            ApiError::RuleNotFound("r".into()),
            ApiError::ItemNotFound("i".into()),
        ] {
            assert_eq!(err.status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn upstream_failures_are_unavailable() {
        assert_eq!(
            ApiError::EmbeddingUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::GenerationUnavailable("down".into()).code(),
            "generation_unavailable"
        );
        assert_eq!(ApiError::invalid("top_k").status(), StatusCode::BAD_REQUEST);
    }
}
