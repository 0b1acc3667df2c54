pub mod bots;
pub mod chat;
pub mod context;
pub mod core;
pub mod history;
pub mod llm;
pub mod rag;
pub mod rules;
pub mod server;
pub mod state;
