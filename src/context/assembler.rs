//! Prompt assembly: retrieval, ranking, budget enforcement.
//!
//! The budget counts characters of the caller-influenced parts of the prompt:
//! the rule block, passage bodies, history messages and the query. The bot's
//! system preamble is operator-supplied and sits outside it. A rule that
//! leaves no room for the query is rejected rather than truncated.

use std::sync::Arc;

use serde::Serialize;

use super::prompt::{passages_block, style_rule_block, system_preamble, StyleRule};
use crate::bots::BotConfig;
use crate::core::config::RetrievalSettings;
use crate::core::errors::ApiError;
use crate::llm::{ChatMessage, Role};
use crate::rag::{PassageRetriever, RetrievedPassage};

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub top_k: usize,
    /// Passages scoring below this are discarded. `None` keeps everything.
    pub min_similarity: Option<f32>,
    pub max_prompt_chars: usize,
    pub max_history_turns: usize,
    /// Answer without passages when retrieval fails instead of failing the turn.
    pub fail_open: bool,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self::from(&RetrievalSettings::default())
    }
}

impl From<&RetrievalSettings> for AssemblerConfig {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            top_k: settings.top_k.max(1),
            min_similarity: settings.min_similarity,
            max_prompt_chars: settings.max_prompt_chars,
            max_history_turns: settings.max_history_turns,
            fail_open: settings.fail_open,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledPrompt {
    pub messages: Vec<ChatMessage>,
    /// Passages that made it into the prompt, most similar first.
    pub passages: Vec<RetrievedPassage>,
    pub dropped_passages: usize,
    pub dropped_history_turns: usize,
}

pub struct ContextAssembler {
    retriever: Arc<dyn PassageRetriever>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(retriever: Arc<dyn PassageRetriever>, config: AssemblerConfig) -> Self {
        Self { retriever, config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    pub async fn assemble(
        &self,
        query: &str,
        history: &[ChatMessage],
        bot: &BotConfig,
        rule: Option<&StyleRule>,
    ) -> Result<AssembledPrompt, ApiError> {
        if query.trim().is_empty() {
            return Err(ApiError::invalid("message must not be empty"));
        }

        let mut passages = if bot.knowledge_base_enabled {
            self.retrieve(query).await?
        } else {
            Vec::new()
        };
        let retrieved = passages.len();

        let mut turns = group_turns(history);
        if turns.len() > self.config.max_history_turns {
            turns.drain(..turns.len() - self.config.max_history_turns);
        }

        let rule_block = rule.filter(|r| !r.is_empty()).map(style_rule_block);
        let rule_chars = rule_block.as_deref().map_or(0, char_len);
        if rule_chars > 0 && rule_chars + char_len(query) > self.config.max_prompt_chars {
            return Err(ApiError::invalid(format!(
                "style rule is too long: {} characters with a prompt budget of {}",
                rule_chars, self.config.max_prompt_chars
            )));
        }

        let dropped_history_turns =
            self.fit_to_budget(query, rule_chars, &mut passages, &mut turns);

        let mut system = system_preamble(bot);
        if let Some(block) = rule_block {
            system.push_str("\n\n");
            system.push_str(&block);
        }
        if !passages.is_empty() {
            system.push_str("\n\n");
            system.push_str(&passages_block(&passages));
        }

        let mut messages = Vec::with_capacity(2 + turns.iter().map(Vec::len).sum::<usize>());
        messages.push(ChatMessage::system(system));
        messages.extend(turns.into_iter().flatten());
        messages.push(ChatMessage::user(query));

        tracing::debug!(
            bot = %bot.id,
            passages = passages.len(),
            dropped_passages = retrieved - passages.len(),
            dropped_history_turns,
            "Prompt assembled"
        );

        Ok(AssembledPrompt {
            messages,
            dropped_passages: retrieved - passages.len(),
            passages,
            dropped_history_turns,
        })
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedPassage>, ApiError> {
        match self.retriever.retrieve(query, self.config.top_k).await {
            Ok(mut passages) => {
                if let Some(floor) = self.config.min_similarity {
                    passages.retain(|p| p.similarity >= floor);
                }
                Ok(passages)
            }
            Err(err) if self.config.fail_open => {
                tracing::warn!("Retrieval failed, answering without knowledge: {}", err);
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Drops lowest-similarity passages, then oldest turns, until the prompt
    /// fits. The query and the rule block are always kept. Returns how many
    /// turns were dropped.
    fn fit_to_budget(
        &self,
        query: &str,
        rule_chars: usize,
        passages: &mut Vec<RetrievedPassage>,
        turns: &mut Vec<Vec<ChatMessage>>,
    ) -> usize {
        let budget = self.config.max_prompt_chars;
        let mut total = char_len(query)
            + rule_chars
            + passages.iter().map(|p| char_len(&p.content)).sum::<usize>()
            + turns.iter().map(|t| turn_len(t)).sum::<usize>();

        while total > budget {
            match passages.pop() {
                Some(passage) => total -= char_len(&passage.content),
                None => break,
            }
        }

        let mut dropped = 0;
        while total > budget && !turns.is_empty() {
            let turn = turns.remove(0);
            total -= turn_len(&turn);
            dropped += 1;
        }

        if total > budget {
            tracing::warn!(
                budget,
                query_chars = char_len(query),
                "Query alone exceeds the prompt budget"
            );
        }
        dropped
    }
}

/// Splits history into turns: each user message starts a new turn and owns
/// the replies after it. System messages from callers are not carried over.
fn group_turns(history: &[ChatMessage]) -> Vec<Vec<ChatMessage>> {
    let mut turns: Vec<Vec<ChatMessage>> = Vec::new();
    for message in history {
        if message.content.trim().is_empty() {
            continue;
        }
        match message.role {
            Role::System => {}
            Role::User => turns.push(vec![message.clone()]),
            Role::Assistant => match turns.last_mut() {
                Some(turn) => turn.push(message.clone()),
                None => turns.push(vec![message.clone()]),
            },
        }
    }
    turns
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn turn_len(turn: &[ChatMessage]) -> usize {
    turn.iter().map(|m| char_len(&m.content)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRetriever {
        passages: Vec<RetrievedPassage>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FixedRetriever {
        fn new(passages: Vec<RetrievedPassage>) -> Arc<Self> {
            Arc::new(Self {
                passages,
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                passages: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PassageRetriever for FixedRetriever {
        async fn retrieve(&self, _query: &str, top_k: usize) -> Result<Vec<RetrievedPassage>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::EmbeddingUnavailable("down".into()));
            }
            Ok(self.passages.iter().take(top_k).cloned().collect())
        }
    }

    fn passage(id: &str, similarity: f32, len: usize) -> RetrievedPassage {
        RetrievedPassage {
            id: id.to_string(),
            title: id.to_uppercase(),
            content: "x".repeat(len),
            category: "faq".to_string(),
            tags: Vec::new(),
            similarity,
        }
    }

    fn history_of_50() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("u".repeat(10)),
            ChatMessage::assistant("a".repeat(15)),
            ChatMessage::user("v".repeat(10)),
            ChatMessage::assistant("b".repeat(15)),
        ]
    }

    fn config(max_prompt_chars: usize) -> AssemblerConfig {
        AssemblerConfig {
            max_prompt_chars,
            ..AssemblerConfig::default()
        }
    }

    fn three_passages() -> Arc<FixedRetriever> {
        FixedRetriever::new(vec![
            passage("p1", 0.9, 40),
            passage("p2", 0.8, 40),
            passage("p3", 0.7, 40),
        ])
    }

    fn history_contents(prompt: &AssembledPrompt) -> Vec<String> {
        prompt.messages[1..prompt.messages.len() - 1]
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }

    #[tokio::test]
    async fn knowledge_disabled_bot_never_searches() {
        let retriever = three_passages();
        let assembler = ContextAssembler::new(retriever.clone(), AssemblerConfig::default());
        let mut bot = BotConfig::default_assistant();
        bot.knowledge_base_enabled = false;

        let prompt = assembler.assemble("refund policy", &[], &bot, None).await.unwrap();

        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert!(prompt.passages.is_empty());
        assert!(!prompt.messages[0].content.contains("[Knowledge base passages]"));
    }

    #[tokio::test]
    async fn lowest_similarity_passages_go_first() {
        // 3 x 40 + 50 + 5 = 175 over a budget of 100
        let assembler = ContextAssembler::new(three_passages(), config(100));
        let bot = BotConfig::default_assistant();
        let history = history_of_50();

        let prompt = assembler.assemble("hello", &history, &bot, None).await.unwrap();

        let ids: Vec<&str> = prompt.passages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1"]);
        assert_eq!(prompt.dropped_passages, 2);
        assert_eq!(prompt.dropped_history_turns, 0);
        assert_eq!(history_contents(&prompt).len(), 4);
        assert_eq!(prompt.messages.last().unwrap().content, "hello");
    }

    #[tokio::test]
    async fn history_is_trimmed_oldest_first_once_passages_are_gone() {
        // passages alone cannot make room: 50 history + 60 query = 110
        let assembler = ContextAssembler::new(three_passages(), config(100));
        let bot = BotConfig::default_assistant();
        let query = "q".repeat(60);

        let prompt = assembler
            .assemble(&query, &history_of_50(), &bot, None)
            .await
            .unwrap();

        assert!(prompt.passages.is_empty());
        assert_eq!(prompt.dropped_history_turns, 1);
        assert_eq!(
            history_contents(&prompt),
            vec!["v".repeat(10), "b".repeat(15)]
        );
        assert_eq!(prompt.messages.last().unwrap().content, query);
    }

    #[tokio::test]
    async fn oversized_query_is_never_truncated() {
        let assembler = ContextAssembler::new(three_passages(), config(10));
        let query = "z".repeat(500);

        let prompt = assembler
            .assemble(&query, &history_of_50(), &BotConfig::default_assistant(), None)
            .await
            .unwrap();

        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[1].content, query);
    }

    #[tokio::test]
    async fn similarity_floor_discards_weak_passages() {
        let assembler = ContextAssembler::new(
            three_passages(),
            AssemblerConfig {
                min_similarity: Some(0.75),
                ..AssemblerConfig::default()
            },
        );
        let prompt = assembler
            .assemble("refund", &[], &BotConfig::default_assistant(), None)
            .await
            .unwrap();

        let ids: Vec<&str> = prompt.passages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        let system = &prompt.messages[0].content;
        assert!(system.find("[1] P1").unwrap() < system.find("[2] P2").unwrap());
    }

    #[tokio::test]
    async fn history_window_keeps_most_recent_turns() {
        let assembler = ContextAssembler::new(
            FixedRetriever::new(Vec::new()),
            AssemblerConfig {
                max_history_turns: 1,
                ..AssemblerConfig::default()
            },
        );
        let mut history = history_of_50();
        history.insert(0, ChatMessage::system("ignored"));

        let prompt = assembler
            .assemble("next", &history, &BotConfig::default_assistant(), None)
            .await
            .unwrap();

        assert_eq!(history_contents(&prompt), vec!["v".repeat(10), "b".repeat(15)]);
    }

    #[tokio::test]
    async fn rule_block_lands_in_system_message() {
        let assembler = ContextAssembler::new(FixedRetriever::new(Vec::new()), AssemblerConfig::default());
        let rule = StyleRule {
            title: Some("Tone".to_string()),
            content: "Answer in one sentence.".to_string(),
            ..StyleRule::default()
        };

        let prompt = assembler
            .assemble("hi", &[], &BotConfig::default_assistant(), Some(&rule))
            .await
            .unwrap();

        assert_eq!(prompt.messages[0].role, Role::System);
        assert!(prompt.messages[0].content.contains("Answer in one sentence."));
    }

    #[tokio::test]
    async fn rule_block_counts_against_the_budget() {
        let rule = StyleRule {
            content: "r".repeat(30),
            ..StyleRule::default()
        };
        let rule_chars = char_len(&style_rule_block(&rule));
        // Room for the rule, the query and the 50 chars of history, not one passage more.
        let assembler = ContextAssembler::new(three_passages(), config(rule_chars + 5 + 50 + 39));

        let prompt = assembler
            .assemble("hello", &history_of_50(), &BotConfig::default_assistant(), Some(&rule))
            .await
            .unwrap();

        assert!(prompt.passages.is_empty());
        assert_eq!(prompt.dropped_passages, 3);
        assert_eq!(history_contents(&prompt).len(), 4);
        assert!(prompt.messages[0].content.contains(&"r".repeat(30)));
    }

    #[tokio::test]
    async fn rule_larger_than_the_budget_is_rejected() {
        let assembler = ContextAssembler::new(three_passages(), config(100));
        let rule = StyleRule {
            content: "r".repeat(50_000),
            ..StyleRule::default()
        };

        let result = assembler
            .assemble("hi", &[], &BotConfig::default_assistant(), Some(&rule))
            .await;

        assert!(matches!(result, Err(ApiError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn retrieval_failure_respects_fail_open() {
        let bot = BotConfig::default_assistant();
        let open = ContextAssembler::new(FixedRetriever::failing(), AssemblerConfig::default());
        assert!(open.assemble("hi", &[], &bot, None).await.unwrap().passages.is_empty());

        let closed = ContextAssembler::new(
            FixedRetriever::failing(),
            AssemblerConfig {
                fail_open: false,
                ..AssemblerConfig::default()
            },
        );
        assert!(matches!(
            closed.assemble("hi", &[], &bot, None).await,
            Err(ApiError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let assembler = ContextAssembler::new(FixedRetriever::new(Vec::new()), AssemblerConfig::default());
        assert!(matches!(
            assembler
                .assemble("  ", &[], &BotConfig::default_assistant(), None)
                .await,
            Err(ApiError::InvalidInput(_))
        ));
    }
}
