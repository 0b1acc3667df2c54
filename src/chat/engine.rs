//! Drives one generation request and turns its output into `StreamEvent`s.
//!
//! State per request: `Idle -> Streaming -> Completed | Failed | Cancelled`.
//! Terminal states never change. Exactly one terminal event is produced unless
//! the consumer cancels first, in which case nothing more is delivered.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::StreamEvent;
use super::reasoning::{ReasoningParser, Segment};
use crate::core::config::ChatSettings;
use crate::core::errors::ApiError;
use crate::llm::{ChatRequest, GenerationGateway};
use crate::rag::RetrievedPassage;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }

    fn can_move_to(self, next: StreamState) -> bool {
        match (self, next) {
            (StreamState::Idle, StreamState::Streaming) => true,
            (StreamState::Idle | StreamState::Streaming, to) => to.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reasoning_open: String,
    pub reasoning_close: String,
    /// Also fall back to a one-shot call when the stream fails before any chunk.
    pub fallback_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&ChatSettings::default())
    }
}

impl From<&ChatSettings> for EngineConfig {
    fn from(settings: &ChatSettings) -> Self {
        Self {
            reasoning_open: settings.reasoning_open.clone(),
            reasoning_close: settings.reasoning_close.clone(),
            fallback_on_error: settings.fallback_on_error,
        }
    }
}

#[derive(Clone)]
struct SharedState(Arc<Mutex<StreamState>>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(StreamState::Idle)))
    }

    fn get(&self) -> StreamState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies the transition if it is legal. Returns whether it happened.
    fn advance(&self, next: StreamState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_move_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// One engine per request.
pub struct StreamingChatEngine {
    gateway: Arc<dyn GenerationGateway>,
    config: EngineConfig,
}

impl StreamingChatEngine {
    pub fn new(gateway: Arc<dyn GenerationGateway>, config: EngineConfig) -> Self {
        Self { gateway, config }
    }

    /// Opens the upstream stream on a background task and returns the
    /// consumer side. `passages` are reported back in `Done`.
    pub fn start(self, request: ChatRequest, passages: Vec<RetrievedPassage>) -> ChatStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let state = SharedState::new();

        let driver = Driver {
            gateway: self.gateway,
            config: self.config,
            tx,
            cancel: cancel.clone(),
            state: state.clone(),
            full_text: String::new(),
            chunks: 0,
        };
        tokio::spawn(driver.run(request, passages));

        ChatStream {
            events: rx,
            cancel,
            state,
            finished: false,
        }
    }
}

/// Lets another task stop a stream it does not own.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: CancellationToken,
    state: SharedState,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if self.state.advance(StreamState::Cancelled) {
            tracing::debug!("Chat stream cancelled");
        }
        self.cancel.cancel();
    }
}

/// Pull side of a chat stream. Yields events until a terminal one, then `None`.
pub struct ChatStream {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    state: SharedState,
    finished: bool,
}

impl ChatStream {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        };

        // A cancel that raced the receive wins.
        if self.cancel.is_cancelled() {
            self.finished = true;
            return None;
        }
        match event {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    let settled = match &event {
                        StreamEvent::Done { .. } => StreamState::Completed,
                        _ => StreamState::Failed,
                    };
                    if !self.state.advance(settled) {
                        return None;
                    }
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Idempotent. After this returns, `next` yields `None`.
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: self.cancel.clone(),
            state: self.state.clone(),
        }
    }

    /// Terminal states are settled on the consumer side: the stream only
    /// reports `Completed` or `Failed` once `next` has returned that event.
    pub fn state(&self) -> StreamState {
        self.state.get()
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    gateway: Arc<dyn GenerationGateway>,
    config: EngineConfig,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    state: SharedState,
    full_text: String,
    chunks: usize,
}

/// Why the driver stopped early.
enum Halt {
    Cancelled,
}

impl Driver {
    async fn run(mut self, request: ChatRequest, passages: Vec<RetrievedPassage>) {
        if !self.state.advance(StreamState::Streaming) {
            return;
        }
        match self.stream_phase(&request).await {
            Err(Halt::Cancelled) => {}
            Ok(None) if self.chunks > 0 => self.finish_done(passages).await,
            Ok(None) => {
                tracing::info!("Stream produced no content, retrying without streaming");
                self.fallback(&request, passages).await;
            }
            Ok(Some(err)) if self.chunks == 0 && self.config.fallback_on_error => {
                tracing::warn!("Stream failed before any content ({}), falling back", err);
                self.fallback(&request, passages).await;
            }
            Ok(Some(err)) => self.finish_error(err).await,
        }
    }

    /// Relays the upstream stream. `Ok(Some(err))` means upstream failed.
    async fn stream_phase(&mut self, request: &ChatRequest) -> Result<Option<ApiError>, Halt> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
            opened = self.gateway.stream_chat(request.clone()) => opened,
        };
        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(err) => return Ok(Some(err)),
        };

        let mut parser = ReasoningParser::new(
            self.config.reasoning_open.clone(),
            self.config.reasoning_close.clone(),
        );
        loop {
            let item = tokio::select! {
                biased;
                // dropping `fragments` closes the upstream connection
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                item = fragments.recv() => item,
            };
            match item {
                Some(Ok(fragment)) => {
                    for segment in parser.push(&fragment) {
                        self.emit_segment(segment).await?;
                    }
                }
                Some(Err(err)) => return Ok(Some(err)),
                None => break,
            }
        }

        for segment in parser.finish() {
            self.emit_segment(segment).await?;
        }
        Ok(None)
    }

    async fn fallback(&mut self, request: &ChatRequest, passages: Vec<RetrievedPassage>) {
        let answer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            answer = self.gateway.chat(request.clone()) => answer,
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => return self.finish_error(err).await,
        };

        let mut parser = ReasoningParser::new(
            self.config.reasoning_open.clone(),
            self.config.reasoning_close.clone(),
        );
        let mut content = String::new();
        let mut segments = parser.push(&answer);
        segments.extend(parser.finish());
        for segment in segments {
            match segment {
                Segment::Content(text) => content.push_str(&text),
                Segment::Reasoning(text) => {
                    if self.send(StreamEvent::Reasoning { text }).await.is_err() {
                        return;
                    }
                }
            }
        }

        if content.trim().is_empty() {
            return self
                .finish_error(ApiError::GenerationUnavailable(
                    "model returned an empty answer".into(),
                ))
                .await;
        }
        if self.emit_segment(Segment::Content(content)).await.is_err() {
            return;
        }
        self.finish_done(passages).await;
    }

    async fn emit_segment(&mut self, segment: Segment) -> Result<(), Halt> {
        match segment {
            Segment::Content(text) => {
                self.full_text.push_str(&text);
                self.chunks += 1;
                self.send(StreamEvent::Chunk { text }).await
            }
            Segment::Reasoning(text) => self.send(StreamEvent::Reasoning { text }).await,
        }
    }

    async fn send(&self, event: StreamEvent) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        self.tx.send(event).await.map_err(|_| Halt::Cancelled)
    }

    async fn finish_done(&mut self, passages: Vec<RetrievedPassage>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let full_text = std::mem::take(&mut self.full_text);
        tracing::debug!(chunks = self.chunks, chars = full_text.len(), "Chat stream completed");
        let _ = self.tx.send(StreamEvent::Done { full_text, passages }).await;
    }

    async fn finish_error(&self, err: ApiError) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::warn!(code = err.code(), "Chat stream failed: {}", err);
        let _ = self.tx.send(StreamEvent::error(&err)).await;
    }
}
