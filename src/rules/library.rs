//! Coding rules kept in `coding_rules.yaml`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{
    CodingRule, LabelCount, RuleDraft, RuleFilter, RulePage, RulePatch, RuleStats,
    DEFAULT_CATEGORY,
};
use crate::core::errors::ApiError;

const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<CodingRule>,
}

#[derive(Clone)]
pub struct RuleLibrary {
    rules: Arc<RwLock<HashMap<String, CodingRule>>>,
    persist: Arc<Mutex<()>>,
    path: PathBuf,
}

impl RuleLibrary {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let rules = match load_rules(&path) {
            Ok(rules) => {
                tracing::info!("Loaded {} coding rule(s) from {:?}", rules.len(), path);
                rules
            }
            Err(e) => {
                tracing::warn!("Failed to load coding rules from {:?}: {}", path, e);
                HashMap::new()
            }
        };
        Self {
            rules: Arc::new(RwLock::new(rules)),
            persist: Arc::new(Mutex::new(())),
            path,
        }
    }

    pub fn create(&self, draft: RuleDraft) -> Result<CodingRule, ApiError> {
        let title = required(&draft.title, "title")?;
        let language = required(&draft.language, "language")?;
        let content = required(&draft.content, "content")?;

        let now = Utc::now();
        let rule = CodingRule {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            description: draft.description.unwrap_or_default().trim().to_string(),
            language,
            content,
            example: draft.example.unwrap_or_default(),
            category: category_or_default(draft.category),
            tags: clean_tags(draft.tags),
            created_at: now,
            updated_at: now,
        };

        let created = rule.clone();
        self.mutate(move |rules| {
            rules.insert(rule.id.clone(), rule);
            Ok(())
        })?;
        tracing::info!(rule_id = %created.id, title = %created.title, "Coding rule created");
        Ok(created)
    }

    pub fn get(&self, id: &str) -> Option<CodingRule> {
        let guard = self.rules.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id).cloned()
    }

    pub fn resolve(&self, id: &str) -> Result<CodingRule, ApiError> {
        self.get(id)
            .ok_or_else(|| ApiError::RuleNotFound(id.to_string()))
    }

    /// Newest first.
    pub fn list(
        &self,
        page: usize,
        page_size: usize,
        filter: &RuleFilter,
    ) -> Result<RulePage, ApiError> {
        if page == 0 {
            return Err(ApiError::invalid("page starts at 1"));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ApiError::invalid(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let category = filter.category.as_deref().map(str::trim).filter(|c| !c.is_empty());
        let language = filter.language.as_deref().map(str::trim).filter(|l| !l.is_empty());
        let matching: Vec<CodingRule> = self
            .newest_first()
            .into_iter()
            .filter(|rule| category.map_or(true, |c| rule.category == c))
            .filter(|rule| language.map_or(true, |l| rule.language == l))
            .collect();

        let total = matching.len();
        let rules = matching
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(RulePage {
            rules,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    /// Substring search over title, description, content, language, category
    /// and tags, newest first.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<CodingRule>, ApiError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(ApiError::invalid("query must not be empty"));
        }
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit.min(MAX_PAGE_SIZE) };
        Ok(self
            .newest_first()
            .into_iter()
            .filter(|rule| rule.matches(&needle))
            .take(limit)
            .collect())
    }

    pub fn update(&self, id: &str, patch: RulePatch) -> Result<CodingRule, ApiError> {
        let title = patch.title.as_deref().map(|t| required(t, "title")).transpose()?;
        let language = patch
            .language
            .as_deref()
            .map(|l| required(l, "language"))
            .transpose()?;
        let content = patch
            .content
            .as_deref()
            .map(|c| required(c, "content"))
            .transpose()?;

        let id = id.to_string();
        let updated = self.mutate(move |rules| {
            let rule = rules
                .get_mut(&id)
                .ok_or_else(|| ApiError::RuleNotFound(id.clone()))?;
            if let Some(title) = title {
                rule.title = title;
            }
            if let Some(language) = language {
                rule.language = language;
            }
            if let Some(content) = content {
                rule.content = content;
            }
            if let Some(description) = patch.description {
                rule.description = description.trim().to_string();
            }
            if let Some(example) = patch.example {
                rule.example = example;
            }
            if patch.category.is_some() {
                rule.category = category_or_default(patch.category);
            }
            if let Some(tags) = patch.tags {
                rule.tags = clean_tags(tags);
            }
            rule.updated_at = Utc::now();
            Ok(rule.clone())
        })?;
        tracing::info!(rule_id = %updated.id, "Coding rule updated");
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), ApiError> {
        let id = id.to_string();
        self.mutate(move |rules| {
            rules
                .remove(&id)
                .map(|_| ())
                .ok_or(ApiError::RuleNotFound(id))
        })
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        self.label_counts(|rule| &rule.category)
            .into_iter()
            .map(|entry| entry.name)
            .collect()
    }

    /// Distinct languages, sorted.
    pub fn languages(&self) -> Vec<String> {
        self.label_counts(|rule| &rule.language)
            .into_iter()
            .map(|entry| entry.name)
            .collect()
    }

    pub fn stats(&self) -> RuleStats {
        let languages = self.label_counts(|rule| &rule.language);
        let categories = self.label_counts(|rule| &rule.category);
        let guard = self.rules.read().unwrap_or_else(|e| e.into_inner());
        RuleStats {
            total_rules: guard.len(),
            total_languages: languages.len(),
            total_categories: categories.len(),
            languages,
            categories,
            latest_created: guard.values().map(|rule| rule.created_at).max(),
        }
    }

    fn newest_first(&self) -> Vec<CodingRule> {
        let mut all: Vec<CodingRule> = {
            let guard = self.rules.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    fn label_counts(&self, label: impl Fn(&CodingRule) -> &String) -> Vec<LabelCount> {
        let guard = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for rule in guard.values() {
            let name = label(rule).trim();
            if !name.is_empty() {
                *counts.entry(name.to_string()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(name, count)| LabelCount { name, count })
            .collect()
    }

    /// Applies `change` and persists the result. The in-memory map is rolled
    /// back if the file cannot be written.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, CodingRule>) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let _persist = self.persist.lock().unwrap_or_else(|e| e.into_inner());

        let (value, snapshot, previous) = {
            let mut guard = self
                .rules
                .write()
                .map_err(|e| ApiError::internal(format!("Lock poisoned: {e}")))?;
            let previous = guard.clone();
            let value = change(&mut guard)?;
            (value, guard.clone(), previous)
        };

        if let Err(err) = save_rules(&self.path, &snapshot) {
            let mut guard = self.rules.write().unwrap_or_else(|e| e.into_inner());
            *guard = previous;
            return Err(err);
        }
        Ok(value)
    }
}

fn required(value: &str, field: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::invalid(format!("rule {field} must not be empty")));
    }
    Ok(value.to_string())
}

fn category_or_default(category: Option<String>) -> String {
    category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if !tag.is_empty() && !cleaned.contains(&tag) {
            cleaned.push(tag);
        }
    }
    cleaned
}

fn load_rules(path: &Path) -> Result<HashMap<String, CodingRule>, ApiError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path).map_err(ApiError::internal)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let file: RulesFile = serde_yaml::from_str(&content).map_err(ApiError::internal)?;
    Ok(file
        .rules
        .into_iter()
        .map(|rule| (rule.id.clone(), rule))
        .collect())
}

fn save_rules(path: &Path, rules: &HashMap<String, CodingRule>) -> Result<(), ApiError> {
    let mut ordered: Vec<CodingRule> = rules.values().cloned().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let yaml = serde_yaml::to_string(&RulesFile { rules: ordered }).map_err(ApiError::internal)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ApiError::internal)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, yaml).map_err(ApiError::internal)?;
    fs::rename(&tmp, path).map_err(ApiError::internal)?;
    Ok(())
}
