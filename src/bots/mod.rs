pub mod registry;
pub mod types;

pub use registry::BotRegistry;
pub use types::{BotConfig, BotDraft, BotPage, BotPatch, BotStats, BotView};
