//! One chat turn from request to persisted answer.
//!
//! Resolves the bot, loads history, assembles the prompt, starts a
//! `StreamingChatEngine`, and on `Done` appends the user message and the
//! answer to the session as one unit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::engine::{CancelHandle, ChatStream, EngineConfig, StreamingChatEngine};
use super::events::StreamEvent;
use crate::bots::{BotConfig, BotRegistry};
use crate::context::{ContextAssembler, StyleRule};
use crate::core::errors::ApiError;
use crate::history::{ConversationMessage, SessionStore};
use crate::llm::{ChatMessage, ChatRequest, GenerationGateway, Role};
use crate::rag::RetrievedPassage;
use crate::rules::RuleLibrary;

pub const DEFAULT_BOT_ID: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatInput {
    pub message: String,
    /// Used only when no `session_id` is given.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Inline rule; takes precedence over `style_rule_id`.
    #[serde(default)]
    pub style_rule: Option<StyleRule>,
    /// Id of a stored coding rule.
    #[serde(default)]
    pub style_rule_id: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub response: String,
    pub relevant_docs: Vec<RetrievedPassage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sampling {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

pub struct ChatService {
    bots: BotRegistry,
    sessions: Arc<SessionStore>,
    assembler: Arc<ContextAssembler>,
    gateway: Arc<dyn GenerationGateway>,
    engine_config: EngineConfig,
    sampling: Sampling,
    rules: Option<RuleLibrary>,
}

impl ChatService {
    pub fn new(
        bots: BotRegistry,
        sessions: Arc<SessionStore>,
        assembler: Arc<ContextAssembler>,
        gateway: Arc<dyn GenerationGateway>,
        engine_config: EngineConfig,
    ) -> Self {
        Self {
            bots,
            sessions,
            assembler,
            gateway,
            engine_config,
            sampling: Sampling::default(),
            rules: None,
        }
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_rules(mut self, rules: RuleLibrary) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Unknown ids fail with `BotNotFound`; no id means the default assistant.
    pub fn resolve_bot(&self, bot_id: Option<&str>) -> Result<BotConfig, ApiError> {
        match bot_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self.bots.resolve(id),
            None => Ok(self
                .bots
                .get(DEFAULT_BOT_ID)
                .unwrap_or_else(BotConfig::default_assistant)),
        }
    }

    /// Everything that can fail before the first frame fails here, so callers
    /// can still answer with a plain error status.
    pub async fn start_turn(&self, input: ChatInput) -> Result<ChatTurn, ApiError> {
        let message = input.message.trim().to_string();
        if message.is_empty() {
            return Err(ApiError::invalid("message must not be empty"));
        }
        let bot = self.resolve_bot(input.bot_id.as_deref())?;
        let rule = match input.style_rule {
            Some(rule) => Some(rule),
            None => self.resolve_rule(input.style_rule_id.as_deref())?,
        };

        let session_id = input
            .session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let history = match session_id.as_deref() {
            Some(id) => {
                let turns = self.assembler.config().max_history_turns;
                self.sessions.history(id, Some(turns * 2)).await?
            }
            None => input.history,
        };

        let prompt = self
            .assembler
            .assemble(&message, &history, &bot, rule.as_ref())
            .await?;

        tracing::info!(
            bot = %bot.id,
            session = session_id.as_deref().unwrap_or("-"),
            passages = prompt.passages.len(),
            "Chat turn started"
        );

        let request = ChatRequest::new(prompt.messages)
            .with_sampling(self.sampling.temperature, self.sampling.max_tokens);
        let stream = StreamingChatEngine::new(self.gateway.clone(), self.engine_config.clone())
            .start(request, prompt.passages);

        let pending = session_id.map(|session_id| PendingAppend {
            sessions: self.sessions.clone(),
            session_id,
            user: ConversationMessage::now(Role::User, message),
        });

        Ok(ChatTurn { stream, pending })
    }

    fn resolve_rule(&self, rule_id: Option<&str>) -> Result<Option<StyleRule>, ApiError> {
        let Some(id) = rule_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        let rules = self
            .rules
            .as_ref()
            .ok_or_else(|| ApiError::RuleNotFound(id.to_string()))?;
        Ok(Some(rules.resolve(id)?.to_style_rule()))
    }

    /// Runs a turn to completion and returns the final answer.
    pub async fn answer(&self, input: ChatInput) -> Result<ChatAnswer, ApiError> {
        let mut turn = self.start_turn(input).await?;
        let session_id = turn.session_id().map(str::to_string);
        while let Some(event) = turn.next().await {
            match event {
                StreamEvent::Done {
                    full_text,
                    passages,
                } => {
                    return Ok(ChatAnswer {
                        response: full_text,
                        relevant_docs: passages,
                        session_id,
                    })
                }
                StreamEvent::Error { message, .. } => {
                    return Err(ApiError::GenerationUnavailable(message))
                }
                StreamEvent::Chunk { .. } | StreamEvent::Reasoning { .. } => {}
            }
        }
        Err(ApiError::GenerationUnavailable(
            "stream ended without an answer".into(),
        ))
    }
}

struct PendingAppend {
    sessions: Arc<SessionStore>,
    session_id: String,
    user: ConversationMessage,
}

impl PendingAppend {
    async fn commit(self, answer: &str) {
        let messages = [
            self.user,
            ConversationMessage::now(Role::Assistant, answer),
        ];
        if let Err(err) = self.sessions.append_all(&self.session_id, &messages).await {
            tracing::warn!(session = %self.session_id, "Failed to save chat turn: {}", err);
        }
    }
}

/// A running chat turn. Events come from the engine unchanged.
pub struct ChatTurn {
    stream: ChatStream,
    pending: Option<PendingAppend>,
}

impl ChatTurn {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        let event = self.stream.next().await?;
        if let StreamEvent::Done { full_text, .. } = &event {
            if let Some(pending) = self.pending.take() {
                pending.commit(full_text).await;
            }
        }
        Some(event)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.session_id.as_str())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.stream.cancel_handle()
    }

    pub fn cancel(&self) {
        self.stream.cancel();
    }
}
