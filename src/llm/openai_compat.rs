use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

use super::provider::{EmbeddingGateway, FragmentStream, GenerationGateway};
use super::stream::{spawn_line_pump, LineOutcome};
use super::types::{ChatRequest, ProviderModel};
use crate::core::config::LlmSettings;
use crate::core::errors::ApiError;

/// OpenAI-compatible server (LM Studio, vLLM, llama.cpp server, ...).
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    base_url: String,
    chat_model: String,
    embedding_model: String,
    api_key: Option<String>,
    chat_timeout: Duration,
    embed_timeout: Duration,
    client: Client,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    id: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiCompatProvider {
    pub fn new(settings: &LlmSettings) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            api_key: settings.api_key.clone().filter(|key| !key.is_empty()),
            chat_timeout: Duration::from_secs(settings.chat_timeout_secs),
            embed_timeout: Duration::from_secs(settings.embed_timeout_secs),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/v1{}", self.base_url, path)
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.chat_model,
            "messages": request.messages,
            "stream": stream,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(t) = request.max_tokens {
                obj.insert("max_tokens".to_string(), json!(t));
            }
            if let Some(s) = &request.stop {
                obj.insert("stop".to_string(), json!(s));
            }
        }
        body
    }
}

/// One server-sent-events line of `/v1/chat/completions`.
pub(crate) fn parse_sse_line(line: &str) -> LineOutcome {
    let Some(data) = line.strip_prefix("data:") else {
        // comments, `event:` and `id:` lines
        return LineOutcome::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return LineOutcome::Finished;
    }

    let frame: Value = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(err) => return LineOutcome::Failed(format!("malformed frame: {err}")),
    };
    if let Some(error) = frame.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return LineOutcome::Failed(message);
    }

    match frame
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        Some(content) if !content.is_empty() => LineOutcome::Fragment(content.to_string()),
        _ => LineOutcome::Skip,
    }
}

fn unavailable(err: reqwest::Error) -> ApiError {
    ApiError::GenerationUnavailable(err.to_string())
}

#[async_trait]
impl GenerationGateway for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.chat_model
    }

    async fn health_check(&self) -> Result<bool, ApiError> {
        let req = self
            .client
            .get(self.endpoint("/models"))
            .timeout(Duration::from_secs(5));
        match self.authorized(req).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn list_models(&self) -> Result<Vec<ProviderModel>, ApiError> {
        let req = self
            .client
            .get(self.endpoint("/models"))
            .timeout(Duration::from_secs(10));
        let res = self.authorized(req).send().await.map_err(unavailable)?;
        if !res.status().is_success() {
            return Err(ApiError::GenerationUnavailable(format!(
                "Failed to list models: {}",
                res.status()
            )));
        }

        let response: ModelsResponse = res.json().await.map_err(unavailable)?;
        Ok(response
            .data
            .into_iter()
            .map(|m| ProviderModel {
                name: m.id.clone(),
                id: m.id,
            })
            .collect())
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, ApiError> {
        let req = self
            .client
            .post(self.endpoint("/chat/completions"))
            .timeout(self.chat_timeout)
            .json(&self.chat_body(&request, false));
        let res = self.authorized(req).send().await.map_err(unavailable)?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::GenerationUnavailable(format!(
                "chat error {status}: {text}"
            )));
        }

        let payload: Value = res.json().await.map_err(unavailable)?;
        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::GenerationUnavailable("response has no choices".into()))
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ApiError> {
        let req = self
            .client
            .post(self.endpoint("/chat/completions"))
            .json(&self.chat_body(&request, true));
        let res = self.authorized(req).send().await.map_err(unavailable)?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::GenerationUnavailable(format!(
                "stream error {status}: {text}"
            )));
        }

        Ok(spawn_line_pump(res, parse_sse_line))
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAiCompatProvider {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let req = self
            .client
            .post(self.endpoint("/embeddings"))
            .timeout(self.embed_timeout)
            .json(&json!({ "model": self.embedding_model, "input": inputs }));
        let res = self
            .authorized(req)
            .send()
            .await
            .map_err(|e| ApiError::EmbeddingUnavailable(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(ApiError::EmbeddingUnavailable(format!(
                "embed error {status}: {text}"
            )));
        }

        let payload: EmbeddingsResponse = res
            .json()
            .await
            .map_err(|e| ApiError::EmbeddingUnavailable(format!("malformed response: {e}")))?;
        order_embeddings(payload.data, inputs.len())
    }
}

fn order_embeddings(mut items: Vec<EmbeddingItem>, expected: usize) -> Result<Vec<Vec<f32>>, ApiError> {
    if items.len() != expected {
        return Err(ApiError::EmbeddingUnavailable(format!(
            "expected {} embeddings, got {}",
            expected,
            items.len()
        )));
    }
    items.sort_by_key(|item| item.index);
    Ok(items.into_iter().map(|item| item.embedding).collect())
}
