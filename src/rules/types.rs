use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::StyleRule;

pub const DEFAULT_CATEGORY: &str = "general";

/// A stored coding rule. Chat requests reference it by id and get it
/// rendered into the prompt as a `StyleRule`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodingRule {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub language: String,
    pub content: String,
    #[serde(default)]
    pub example: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodingRule {
    pub fn to_style_rule(&self) -> StyleRule {
        StyleRule {
            title: non_blank(&self.title),
            description: non_blank(&self.description),
            language: non_blank(&self.language),
            category: non_blank(&self.category),
            content: self.content.clone(),
            example: non_blank(&self.example),
        }
    }

    /// Case-insensitive substring match; `needle` must already be lowercase.
    pub(crate) fn matches(&self, needle: &str) -> bool {
        [
            &self.title,
            &self.description,
            &self.content,
            &self.language,
            &self.category,
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(needle))
            || self.tags.iter().any(|tag| tag.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub language: String,
    pub content: String,
    #[serde(default)]
    pub example: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub content: Option<String>,
    pub example: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Narrows a listing to one category and/or language (exact match).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RulePage {
    pub rules: Vec<CodingRule>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStats {
    pub total_rules: usize,
    pub total_languages: usize,
    pub total_categories: usize,
    pub languages: Vec<LabelCount>,
    pub categories: Vec<LabelCount>,
    pub latest_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedRule {
    pub id: String,
    pub title: String,
    pub language: String,
}

/// Result of rewriting a snippet under one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub original_code: String,
    pub improved_code: String,
    pub explanation: String,
    pub rule_applied: AppliedRule,
}

fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}
