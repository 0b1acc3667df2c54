use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::provider::{EmbeddingGateway, FragmentStream, GenerationGateway};
use super::stream::{spawn_line_pump, LineOutcome};
use super::types::{ChatRequest, ProviderModel};
use crate::core::config::LlmSettings;
use crate::core::errors::ApiError;

/// Native Ollama API: NDJSON `/api/chat`, batch `/api/embed`.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    chat_model: String,
    embedding_model: String,
    keep_alive: Option<String>,
    chat_timeout: Duration,
    embed_timeout: Duration,
    client: Client,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagInfo>,
}

#[derive(Deserialize)]
struct TagInfo {
    name: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaProvider {
    pub fn new(settings: &LlmSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            keep_alive: settings.keep_alive.clone(),
            chat_timeout: Duration::from_secs(settings.chat_timeout_secs),
            embed_timeout: Duration::from_secs(settings.embed_timeout_secs),
            client,
        }
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.chat_model,
            "messages": request.messages,
            "stream": stream,
        });

        let mut options = Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".to_string(), json!(t));
        }
        if let Some(n) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(n));
        }
        if let Some(stop) = &request.stop {
            options.insert("stop".to_string(), json!(stop));
        }
        if let Some(obj) = body.as_object_mut() {
            if !options.is_empty() {
                obj.insert("options".to_string(), Value::Object(options));
            }
            if let Some(keep_alive) = &self.keep_alive {
                obj.insert("keep_alive".to_string(), json!(keep_alive));
            }
        }
        body
    }
}

/// One NDJSON line of `/api/chat`.
pub(crate) fn parse_chat_line(line: &str) -> LineOutcome {
    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => return LineOutcome::Failed(format!("malformed frame from Ollama: {err}")),
    };
    if let Some(message) = frame.get("error").and_then(Value::as_str) {
        return LineOutcome::Failed(message.to_string());
    }

    let content = frame
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let done = frame.get("done").and_then(Value::as_bool).unwrap_or(false);

    match (content.is_empty(), done) {
        (false, _) => LineOutcome::Fragment(content.to_string()),
        (true, true) => LineOutcome::Finished,
        (true, false) => LineOutcome::Skip,
    }
}

async fn error_text(res: reqwest::Response) -> String {
    let status = res.status();
    let text = res.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    format!("{status}: {detail}")
}

#[async_trait]
impl GenerationGateway for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.chat_model
    }

    async fn health_check(&self) -> Result<bool, ApiError> {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(err) => {
                tracing::debug!("Ollama health check failed: {}", err);
                Ok(false)
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ProviderModel>, ApiError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ApiError::GenerationUnavailable(error_text(res).await));
        }

        let tags: TagsResponse = res
            .json()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(e.to_string()))?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ProviderModel {
                id: m.model.unwrap_or_else(|| m.name.clone()),
                name: m.name,
            })
            .collect())
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, ApiError> {
        let url = format!("{}/api/chat", self.base_url);
        let res = self
            .client
            .post(&url)
            .timeout(self.chat_timeout)
            .json(&self.chat_body(&request, false))
            .send()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ApiError::GenerationUnavailable(error_text(res).await));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(format!("malformed response: {e}")))?;
        if let Some(message) = payload.get("error").and_then(Value::as_str) {
            return Err(ApiError::GenerationUnavailable(message.to_string()));
        }
        Ok(payload
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ApiError> {
        let url = format!("{}/api/chat", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&self.chat_body(&request, true))
            .send()
            .await
            .map_err(|e| ApiError::GenerationUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ApiError::GenerationUnavailable(error_text(res).await));
        }

        tracing::debug!(model = %self.chat_model, "Ollama stream opened");
        Ok(spawn_line_pump(res, parse_chat_line))
    }
}

#[async_trait]
impl EmbeddingGateway for OllamaProvider {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/embed", self.base_url);
        let mut body = json!({
            "model": self.embedding_model,
            "input": inputs,
            "truncate": true,
        });
        if let (Some(obj), Some(keep_alive)) = (body.as_object_mut(), &self.keep_alive) {
            obj.insert("keep_alive".to_string(), json!(keep_alive));
        }

        let res = self
            .client
            .post(&url)
            .timeout(self.embed_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::EmbeddingUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ApiError::EmbeddingUnavailable(error_text(res).await));
        }

        let payload: EmbedResponse = res
            .json()
            .await
            .map_err(|e| ApiError::EmbeddingUnavailable(format!("malformed response: {e}")))?;
        if payload.embeddings.len() != inputs.len() {
            return Err(ApiError::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                payload.embeddings.len()
            )));
        }
        Ok(payload.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_line_yields_content_until_done() {
        assert_eq!(
            parse_chat_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#),
            LineOutcome::Fragment("Hel".to_string())
        );
        assert_eq!(
            parse_chat_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#),
            LineOutcome::Finished
        );
    }

    #[test]
    fn error_and_garbage_lines_fail_the_stream() {
        assert_eq!(
            parse_chat_line(r#"{"error":"model not found"}"#),
            LineOutcome::Failed("model not found".to_string())
        );
        assert!(matches!(parse_chat_line("<html>"), LineOutcome::Failed(_)));
    }

    #[test]
    fn chat_body_carries_options_and_keep_alive() {
        let settings = LlmSettings {
            keep_alive: Some("5m".to_string()),
            ..LlmSettings::default()
        };
        let provider = OllamaProvider::new(&settings);
        let request = ChatRequest::new(vec![]).with_sampling(Some(0.2), Some(256));

        let body = provider.chat_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 256);
        assert_eq!(body["keep_alive"], "5m");
        assert_eq!(body["model"], settings.chat_model.as_str());
    }
}
