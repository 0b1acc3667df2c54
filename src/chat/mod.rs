pub mod engine;
pub mod events;
pub mod reasoning;
pub mod service;

pub use engine::{CancelHandle, ChatStream, EngineConfig, StreamState, StreamingChatEngine};
pub use events::StreamEvent;
pub use reasoning::{strip_reasoning, ReasoningParser, Segment};
pub use service::{ChatAnswer, ChatInput, ChatService, ChatTurn, Sampling};
