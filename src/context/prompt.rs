use serde::{Deserialize, Serialize};

use crate::bots::BotConfig;
use crate::rag::RetrievedPassage;

const ANSWERING_RULES: &str = "\
Answering rules:
1. Prefer the information from the knowledge base passages.
2. Keep answers accurate, friendly and professional.
3. If the knowledge base has nothing relevant, say so honestly.
4. Offer concrete next steps where they help.";

/// A single rule the caller wants applied to this answer, for example a
/// coding convention or a tone requirement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleRule {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub content: String,
    #[serde(default)]
    pub example: Option<String>,
}

impl StyleRule {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

pub fn system_preamble(bot: &BotConfig) -> String {
    let mut preamble = String::new();
    if let Some(persona) = bot.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        preamble.push_str(persona.trim());
        preamble.push_str("\n\n");
    }
    preamble.push_str(&format!("You are {}.", bot.name));
    if !bot.description.trim().is_empty() {
        preamble.push(' ');
        preamble.push_str(bot.description.trim());
    }
    preamble.push_str("\n\n");
    preamble.push_str(ANSWERING_RULES);
    preamble
}

pub fn style_rule_block(rule: &StyleRule) -> String {
    let mut block = String::from("==== Rule to follow ====\n");
    for (label, value) in [
        ("Title", &rule.title),
        ("Description", &rule.description),
        ("Language", &rule.language),
        ("Category", &rule.category),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            block.push_str(&format!("{label}: {}\n", value.trim()));
        }
    }
    block.push('\n');
    block.push_str(rule.content.trim());
    if let Some(example) = rule.example.as_deref().filter(|e| !e.trim().is_empty()) {
        block.push_str("\n\nExample:\n");
        block.push_str(example.trim());
    }
    block.push_str("\n\nApply this rule strictly in your answer.");
    block
}

/// Passages numbered in the order given, which is descending similarity.
pub fn passages_block(passages: &[RetrievedPassage]) -> String {
    let mut block = String::from("[Knowledge base passages]\n");
    for (i, passage) in passages.iter().enumerate() {
        block.push_str(&format!(
            "[{}] {} (category: {}, relevance: {:.2})\n{}\n\n",
            i + 1,
            passage.title,
            passage.category,
            passage.similarity,
            passage.content
        ));
    }
    block.trim_end().to_string()
}
