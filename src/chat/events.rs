use serde::Serialize;

use crate::core::errors::ApiError;
use crate::rag::RetrievedPassage;

/// One frame of a chat stream. Serialized as the wire frame
/// (`{"type":"chunk","content":..}` and so on).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        #[serde(rename = "content")]
        text: String,
    },
    Reasoning {
        #[serde(rename = "content")]
        text: String,
    },
    Done {
        #[serde(rename = "full_response")]
        full_text: String,
        #[serde(rename = "relevant_docs")]
        passages: Vec<RetrievedPassage>,
    },
    Error {
        #[serde(rename = "error")]
        message: String,
        code: String,
    },
}

impl StreamEvent {
    pub fn error(err: &ApiError) -> Self {
        StreamEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_wire_field_names() {
        let chunk = serde_json::to_value(StreamEvent::Chunk { text: "Hi".into() }).unwrap();
        assert_eq!(chunk, json!({ "type": "chunk", "content": "Hi" }));

        let done = serde_json::to_value(StreamEvent::Done {
            full_text: "Hi".into(),
            passages: Vec::new(),
        })
        .unwrap();
        assert_eq!(
            done,
            json!({ "type": "done", "full_response": "Hi", "relevant_docs": [] })
        );

        let error = serde_json::to_value(StreamEvent::error(&ApiError::GenerationUnavailable(
            "timeout".into(),
        )))
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "generation_unavailable");
        assert!(error["error"].as_str().unwrap().contains("timeout"));
    }
}
