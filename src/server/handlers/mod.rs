pub mod bots;
pub mod chat;
pub mod config;
pub mod health;
pub mod knowledge;
pub mod rules;
pub mod sessions;
