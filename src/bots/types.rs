use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AVATAR: &str = "/default-bot-avatar.png";
pub const DEFAULT_POSITION: &str = "bottom-right";
pub const DEFAULT_SIZE: &str = "medium";
pub const DEFAULT_PRIMARY_COLOR: &str = "#1890ff";
pub const DEFAULT_GREETING: &str = "Hello! How can I help you today?";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_avatar")]
    pub avatar: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_primary_color")]
    pub primary_color: String,
    #[serde(default = "default_greeting")]
    pub greeting_message: String,
    #[serde(default = "default_true")]
    pub knowledge_base_enabled: bool,
    /// Persona text placed ahead of the answering instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotConfig {
    /// Reference handed to the embeddable widget.
    pub fn embed_url(&self) -> String {
        format!("/bot/{}", self.id)
    }

    /// Built-in assistant used by the plain chat endpoint.
    pub fn default_assistant() -> Self {
        let now = Utc::now();
        Self {
            id: "default".to_string(),
            name: "Support Assistant".to_string(),
            description: "A professional customer-support assistant.".to_string(),
            avatar: default_avatar(),
            position: default_position(),
            size: default_size(),
            primary_color: default_primary_color(),
            greeting_message: default_greeting(),
            knowledge_base_enabled: true,
            system_prompt: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Bot as returned to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct BotView {
    #[serde(flatten)]
    pub bot: BotConfig,
    pub embed_url: String,
}

impl From<BotConfig> for BotView {
    fn from(bot: BotConfig) -> Self {
        let embed_url = bot.embed_url();
        Self { bot, embed_url }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
    #[serde(default)]
    pub greeting_message: Option<String>,
    #[serde(default)]
    pub knowledge_base_enabled: Option<bool>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub position: Option<String>,
    pub size: Option<String>,
    pub primary_color: Option<String>,
    pub greeting_message: Option<String>,
    pub knowledge_base_enabled: Option<bool>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotPage {
    pub bots: Vec<BotView>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotStats {
    pub total: usize,
    pub knowledge_enabled: usize,
    pub knowledge_disabled: usize,
}

fn default_avatar() -> String {
    DEFAULT_AVATAR.to_string()
}

fn default_position() -> String {
    DEFAULT_POSITION.to_string()
}

fn default_size() -> String {
    DEFAULT_SIZE.to_string()
}

fn default_primary_color() -> String {
    DEFAULT_PRIMARY_COLOR.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

fn default_true() -> bool {
    true
}
