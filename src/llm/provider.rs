use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ProviderModel};
use crate::core::errors::ApiError;

/// Incremental output of a generation call. Dropping the receiver closes the
/// upstream connection.
pub type FragmentStream = mpsc::Receiver<Result<String, ApiError>>;

#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    fn model(&self) -> &str;

    /// One vector per input, in input order. Any transport or protocol failure
    /// is `EmbeddingUnavailable`.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;

    async fn embed_one(&self, input: &str) -> Result<Vec<f32>, ApiError> {
        self.embed(&[input.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::EmbeddingUnavailable("empty embedding response".into()))
    }
}

#[async_trait]
pub trait GenerationGateway: Send + Sync {
    /// provider name (e.g. "ollama", "openai")
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn health_check(&self) -> Result<bool, ApiError>;

    async fn list_models(&self) -> Result<Vec<ProviderModel>, ApiError>;

    /// one-shot completion
    async fn chat(&self, request: ChatRequest) -> Result<String, ApiError>;

    /// streaming completion
    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ApiError>;
}
