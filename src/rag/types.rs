use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "general";

/// Knowledge entry as seen by callers. The embedding never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An item together with its committed embedding.
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub item: KnowledgeItem,
    pub embedding: Vec<f32>,
}

/// Tags arrive either as a list or as one comma-delimited string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TagsInput {
    List(Vec<String>),
    Delimited(String),
}

impl Default for TagsInput {
    fn default() -> Self {
        TagsInput::List(Vec::new())
    }
}

impl TagsInput {
    pub fn normalize(&self) -> BTreeSet<String> {
        let raw: Vec<&str> = match self {
            TagsInput::List(items) => items.iter().flat_map(|item| item.split(',')).collect(),
            TagsInput::Delimited(text) => text.split(',').collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl From<Vec<&str>> for TagsInput {
    fn from(tags: Vec<&str>) -> Self {
        TagsInput::List(tags.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnowledgeDraft {
    /// Explicit id makes the write an upsert of that id.
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: TagsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnowledgePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<TagsInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: Vec<String>,
    pub similarity: f32,
}

impl RetrievedPassage {
    pub fn from_item(item: &KnowledgeItem, similarity: f32) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            content: item.content.clone(),
            category: item.category.clone(),
            tags: item.tags.iter().cloned().collect(),
            similarity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgePage {
    pub items: Vec<KnowledgeItem>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KnowledgeStats {
    pub total_count: usize,
    pub total_size_bytes: usize,
    pub distinct_categories: usize,
    pub categories: BTreeMap<String, usize>,
    pub popular_tags: Vec<TagCount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_normalize_from_either_shape() {
        let from_list = TagsInput::from(vec![" refund ", "billing", "", "refund"]).normalize();
        let from_text: TagsInput = serde_json::from_str(r#""billing, refund,,""#).unwrap();

        assert_eq!(from_list, from_text.normalize());
        assert_eq!(from_list.len(), 2);
    }

    #[test]
    fn draft_tags_default_to_empty() {
        let draft: KnowledgeDraft =
            serde_json::from_str(r#"{"title":"t","content":"c"}"#).unwrap();
        assert!(draft.tags.normalize().is_empty());
        assert!(draft.category.is_none());
    }
}
