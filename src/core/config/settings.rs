use std::env;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::ApiError;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_CHAT_MODEL: &str = "deepseek-r1:latest";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text:latest";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub llm: LlmSettings,
    pub knowledge: KnowledgeSettings,
    pub retrieval: RetrievalSettings,
    pub chat: ChatSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    Ollama,
    /// Any server exposing `/v1/chat/completions` and `/v1/embeddings`.
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub api_key: Option<String>,
    pub keep_alive: Option<String>,
    pub chat_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Ollama,
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_key: None,
            keep_alive: None,
            chat_timeout_secs: 120,
            embed_timeout_secs: 60,
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeSettings {
    pub backend: KnowledgeBackend,
    /// When unset, the dimension of the first committed embedding is locked in.
    pub embedding_dimension: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub min_similarity: Option<f32>,
    pub max_prompt_chars: usize,
    pub max_history_turns: usize,
    pub fail_open: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: None,
            max_prompt_chars: 12_000,
            max_history_turns: 10,
            fail_open: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub reasoning_open: String,
    pub reasoning_close: String,
    pub fallback_on_error: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            reasoning_open: "<think>".to_string(),
            reasoning_close: "</think>".to_string(),
            fallback_on_error: false,
        }
    }
}

impl AppSettings {
    pub fn from_value(value: &Value) -> Result<Self, ApiError> {
        if value.as_object().is_some_and(|map| map.is_empty()) {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| ApiError::InvalidInput(format!("Invalid configuration: {err}")))
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("OLLAMA_BASE_URL").or_else(|| non_empty("LLM_BASE_URL")) {
            self.llm.base_url = url;
        }
        if let Some(model) = non_empty("CHAT_MODEL") {
            self.llm.chat_model = model;
        }
        if let Some(model) = non_empty("EMBEDDING_MODEL") {
            self.llm.embedding_model = model;
        }
        if let Some(key) = non_empty("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(host) = non_empty("SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = non_empty("PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(level) = non_empty("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(origins) = non_empty("ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
    }
}
