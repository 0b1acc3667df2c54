pub mod ollama;
pub mod openai_compat;
pub mod provider;
pub(crate) mod stream;
pub mod types;

use std::sync::Arc;

pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{EmbeddingGateway, FragmentStream, GenerationGateway};
pub use types::{ChatMessage, ChatRequest, ProviderModel, Role};

use crate::core::config::{LlmProviderKind, LlmSettings};

pub struct Gateways {
    pub generation: Arc<dyn GenerationGateway>,
    pub embedding: Arc<dyn EmbeddingGateway>,
}

/// Both roles are served by the same upstream server.
pub fn build_gateways(settings: &LlmSettings) -> Gateways {
    tracing::info!(
        provider = ?settings.provider,
        base_url = %settings.base_url,
        chat_model = %settings.chat_model,
        embedding_model = %settings.embedding_model,
        "Configuring model gateways"
    );
    match settings.provider {
        LlmProviderKind::Ollama => {
            let provider = Arc::new(OllamaProvider::new(settings));
            Gateways {
                generation: provider.clone(),
                embedding: provider,
            }
        }
        LlmProviderKind::OpenAi => {
            let provider = Arc::new(OpenAiCompatProvider::new(settings));
            Gateways {
                generation: provider.clone(),
                embedding: provider,
            }
        }
    }
}
