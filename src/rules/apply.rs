//! Rewrites a code snippet so it follows one stored rule.

use super::types::{AppliedRule, ApplyOutcome, CodingRule};
use crate::chat::{strip_reasoning, EngineConfig};
use crate::context::prompt::style_rule_block;
use crate::core::errors::ApiError;
use crate::llm::{ChatMessage, ChatRequest, GenerationGateway};

const REVIEWER_PREAMBLE: &str = "\
You are a meticulous code reviewer. Rewrite the user's code so that it follows \
the rule below. Keep its behavior unchanged.";

const REPLY_FORMAT: &str = "\
Reply with the revised code in a single fenced code block, followed by a short \
explanation of every change.";

const DEFAULT_EXPLANATION: &str = "The code was revised to follow the rule.";

pub async fn apply_rule(
    gateway: &dyn GenerationGateway,
    rule: &CodingRule,
    code: &str,
    reasoning: &EngineConfig,
) -> Result<ApplyOutcome, ApiError> {
    if code.trim().is_empty() {
        return Err(ApiError::invalid("code must not be empty"));
    }

    let system = format!(
        "{REVIEWER_PREAMBLE}\n\n{}\n\n{REPLY_FORMAT}",
        style_rule_block(&rule.to_style_rule())
    );
    let fence = rule.language.trim().to_lowercase();
    let user = format!("Apply the rule to this code:\n\n```{fence}\n{}\n```", code.trim_end());

    let reply = gateway
        .chat(ChatRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ]))
        .await?;
    let reply = strip_reasoning(&reply, &reasoning.reasoning_open, &reasoning.reasoning_close);
    let (improved_code, explanation) = split_reply(&reply);

    tracing::info!(rule_id = %rule.id, "Coding rule applied");
    Ok(ApplyOutcome {
        original_code: code.to_string(),
        improved_code,
        explanation,
        rule_applied: AppliedRule {
            id: rule.id.clone(),
            title: rule.title.clone(),
            language: rule.language.clone(),
        },
    })
}

/// First fenced block is the code, whatever follows it the explanation.
/// A reply without a complete fence is taken as code.
fn split_reply(reply: &str) -> (String, String) {
    let mut parts = reply.splitn(3, "```").skip(1);
    let (Some(block), Some(after)) = (parts.next(), parts.next()) else {
        return (reply.trim().to_string(), DEFAULT_EXPLANATION.to_string());
    };

    let code = match block.split_once('\n') {
        Some((info, body)) if !info.trim().contains(char::is_whitespace) => body,
        _ => block,
    };
    let explanation = after.trim();
    let explanation = explanation
        .strip_prefix("Explanation:")
        .unwrap_or(explanation)
        .trim();
    let explanation = if explanation.is_empty() {
        DEFAULT_EXPLANATION.to_string()
    } else {
        explanation.to_string()
    };
    (code.trim().to_string(), explanation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FragmentStream, ProviderModel};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct CannedGateway {
        reply: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl CannedGateway {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationGateway for CannedGateway {
        fn name(&self) -> &str {
            "canned"
        }

        fn model(&self) -> &str {
            "canned-1"
        }

        async fn health_check(&self) -> Result<bool, ApiError> {
            Ok(true)
        }

        async fn list_models(&self) -> Result<Vec<ProviderModel>, ApiError> {
            Ok(Vec::new())
        }

        async fn chat(&self, request: ChatRequest) -> Result<String, ApiError> {
            self.seen.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }

        async fn stream_chat(&self, _request: ChatRequest) -> Result<FragmentStream, ApiError> {
            Err(ApiError::GenerationUnavailable("not streamed".into()))
        }
    }

    fn rule() -> CodingRule {
        let now = Utc::now();
        CodingRule {
            id: "r1".into(),
            title: "Snake case".into(),
            description: String::new(),
            language: "Rust".into(),
            content: "Functions use snake_case names.".into(),
            example: String::new(),
            category: "style".into(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn reply_is_split_into_code_and_explanation() {
        let gateway = CannedGateway::new(
            "<think>rename it</think>```rust\nfn do_work() {}\n```\nExplanation: renamed doWork.",
        );

        let outcome = apply_rule(&gateway, &rule(), "fn doWork() {}", &EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(outcome.improved_code, "fn do_work() {}");
        assert_eq!(outcome.explanation, "renamed doWork.");
        assert_eq!(outcome.original_code, "fn doWork() {}");
        assert_eq!(outcome.rule_applied.id, "r1");

        let seen = gateway.seen.lock().unwrap();
        assert!(seen[0].messages[0].content.contains("Functions use snake_case names."));
        assert!(seen[0].messages[1].content.contains("```rust\nfn doWork() {}"));
    }

    #[tokio::test]
    async fn unfenced_reply_is_taken_as_code() {
        let gateway = CannedGateway::new("fn do_work() {}");
        let outcome = apply_rule(&gateway, &rule(), "fn doWork() {}", &EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(outcome.improved_code, "fn do_work() {}");
        assert_eq!(outcome.explanation, DEFAULT_EXPLANATION);
    }

    #[tokio::test]
    async fn blank_code_is_rejected_without_calling_the_model() {
        let gateway = CannedGateway::new("unused");
        let result = apply_rule(&gateway, &rule(), "  ", &EngineConfig::default()).await;

        assert!(matches!(result, Err(ApiError::InvalidInput(_))));
        assert!(gateway.seen.lock().unwrap().is_empty());
    }
}
