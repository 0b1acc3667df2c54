//! Bot configurations kept in `bots.yaml`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{BotConfig, BotDraft, BotPage, BotPatch, BotStats, BotView};
use crate::core::errors::ApiError;

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BotsFile {
    #[serde(default)]
    bots: Vec<BotConfig>,
}

/// Shared via `Arc` in `AppState`. Reads never touch the disk.
#[derive(Clone)]
pub struct BotRegistry {
    bots: Arc<RwLock<HashMap<String, BotConfig>>>,
    // serializes mutate-then-save so the file always matches the last write
    persist: Arc<Mutex<()>>,
    path: PathBuf,
}

impl BotRegistry {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let bots = match load_bots(&path) {
            Ok(bots) => {
                tracing::info!("Loaded {} bot(s) from {:?}", bots.len(), path);
                bots
            }
            Err(e) => {
                tracing::warn!("Failed to load bots from {:?}: {}", path, e);
                HashMap::new()
            }
        };
        Self {
            bots: Arc::new(RwLock::new(bots)),
            persist: Arc::new(Mutex::new(())),
            path,
        }
    }

    pub fn create(&self, draft: BotDraft) -> Result<BotConfig, ApiError> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::invalid("bot name must not be empty"));
        }
        let id = match draft.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => validate_id(id)?.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let mut bot = BotConfig::default_assistant();
        let now = Utc::now();
        bot.id = id;
        bot.name = name;
        bot.description = draft.description.unwrap_or_default();
        bot.created_at = now;
        bot.updated_at = now;
        if let Some(avatar) = draft.avatar {
            bot.avatar = avatar;
        }
        if let Some(position) = draft.position {
            bot.position = position;
        }
        if let Some(size) = draft.size {
            bot.size = size;
        }
        if let Some(color) = draft.primary_color {
            bot.primary_color = color;
        }
        if let Some(greeting) = draft.greeting_message {
            bot.greeting_message = greeting;
        }
        if let Some(enabled) = draft.knowledge_base_enabled {
            bot.knowledge_base_enabled = enabled;
        }
        bot.system_prompt = draft.system_prompt.filter(|p| !p.trim().is_empty());

        let created = bot.clone();
        self.mutate(move |bots| {
            if bots.contains_key(&bot.id) {
                return Err(ApiError::invalid(format!("bot '{}' already exists", bot.id)));
            }
            bots.insert(bot.id.clone(), bot);
            Ok(())
        })?;
        tracing::info!(bot_id = %created.id, "Bot created");
        Ok(created)
    }

    pub fn get(&self, id: &str) -> Option<BotConfig> {
        let guard = self.bots.read().unwrap_or_else(|e| e.into_inner());
        guard.get(id).cloned()
    }

    pub fn resolve(&self, id: &str) -> Result<BotConfig, ApiError> {
        self.get(id)
            .ok_or_else(|| ApiError::BotNotFound(id.to_string()))
    }

    /// Newest first.
    pub fn list(&self, page: usize, page_size: usize) -> Result<BotPage, ApiError> {
        if page == 0 {
            return Err(ApiError::invalid("page starts at 1"));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ApiError::invalid(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut all: Vec<BotConfig> = {
            let guard = self.bots.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = all.len();
        let bots = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(BotView::from)
            .collect();

        Ok(BotPage {
            bots,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    pub fn update(&self, id: &str, patch: BotPatch) -> Result<BotConfig, ApiError> {
        if let Some(name) = patch.name.as_deref() {
            if name.trim().is_empty() {
                return Err(ApiError::invalid("bot name must not be empty"));
            }
        }
        let id = id.to_string();
        self.mutate(move |bots| {
            let bot = bots
                .get_mut(&id)
                .ok_or_else(|| ApiError::BotNotFound(id.clone()))?;
            if let Some(name) = patch.name {
                bot.name = name.trim().to_string();
            }
            if let Some(description) = patch.description {
                bot.description = description;
            }
            if let Some(avatar) = patch.avatar {
                bot.avatar = avatar;
            }
            if let Some(position) = patch.position {
                bot.position = position;
            }
            if let Some(size) = patch.size {
                bot.size = size;
            }
            if let Some(color) = patch.primary_color {
                bot.primary_color = color;
            }
            if let Some(greeting) = patch.greeting_message {
                bot.greeting_message = greeting;
            }
            if let Some(enabled) = patch.knowledge_base_enabled {
                bot.knowledge_base_enabled = enabled;
            }
            if let Some(prompt) = patch.system_prompt {
                bot.system_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
            }
            bot.updated_at = Utc::now();
            Ok(bot.clone())
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), ApiError> {
        let id = id.to_string();
        self.mutate(move |bots| {
            bots.remove(&id)
                .map(|_| ())
                .ok_or(ApiError::BotNotFound(id))
        })
    }

    pub fn stats(&self) -> BotStats {
        let guard = self.bots.read().unwrap_or_else(|e| e.into_inner());
        let knowledge_enabled = guard.values().filter(|b| b.knowledge_base_enabled).count();
        BotStats {
            total: guard.len(),
            knowledge_enabled,
            knowledge_disabled: guard.len() - knowledge_enabled,
        }
    }

    /// Applies `change` and persists the result. The in-memory map is rolled
    /// back if the file cannot be written.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, BotConfig>) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let _persist = self.persist.lock().unwrap_or_else(|e| e.into_inner());

        let (value, snapshot, previous) = {
            let mut guard = self
                .bots
                .write()
                .map_err(|e| ApiError::internal(format!("Lock poisoned: {e}")))?;
            let previous = guard.clone();
            let value = change(&mut guard)?;
            (value, guard.clone(), previous)
        };

        if let Err(err) = save_bots(&self.path, &snapshot) {
            let mut guard = self.bots.write().unwrap_or_else(|e| e.into_inner());
            *guard = previous;
            return Err(err);
        }
        Ok(value)
    }
}

fn validate_id(id: &str) -> Result<&str, ApiError> {
    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(ApiError::invalid(
            "bot id may only contain letters, digits, '-' and '_'",
        ))
    }
}

fn load_bots(path: &Path) -> Result<HashMap<String, BotConfig>, ApiError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path).map_err(ApiError::internal)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let file: BotsFile = serde_yaml::from_str(&content).map_err(ApiError::internal)?;
    Ok(file
        .bots
        .into_iter()
        .map(|bot| (bot.id.clone(), bot))
        .collect())
}

fn save_bots(path: &Path, bots: &HashMap<String, BotConfig>) -> Result<(), ApiError> {
    let mut ordered: Vec<BotConfig> = bots.values().cloned().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let yaml = serde_yaml::to_string(&BotsFile { bots: ordered }).map_err(ApiError::internal)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ApiError::internal)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, yaml).map_err(ApiError::internal)?;
    fs::rename(&tmp, path).map_err(ApiError::internal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(name: &str) -> BotDraft {
        BotDraft {
            name: name.to_string(),
            ..BotDraft::default()
        }
    }

    #[test]
    fn create_applies_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bots.yaml");
        let registry = BotRegistry::with_path(&path);

        let bot = registry
            .create(BotDraft {
                knowledge_base_enabled: Some(false),
                ..draft("Helpdesk")
            })
            .unwrap();
        assert_eq!(bot.position, super::super::types::DEFAULT_POSITION);
        assert!(!bot.knowledge_base_enabled);
        assert_eq!(bot.embed_url(), format!("/bot/{}", bot.id));

        let reopened = BotRegistry::with_path(&path);
        assert_eq!(reopened.resolve(&bot.id).unwrap(), bot);
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn explicit_ids_must_be_unique_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BotRegistry::with_path(dir.path().join("bots.yaml"));

        let with_id = BotDraft {
            id: Some("sales".into()),
            ..draft("Sales")
        };
        registry.create(with_id.clone()).unwrap();
        assert!(matches!(registry.create(with_id), Err(ApiError::InvalidInput(_))));

        let bad = BotDraft {
            id: Some("../escape".into()),
            ..draft("Bad")
        };
        assert!(matches!(registry.create(bad), Err(ApiError::InvalidInput(_))));
        assert!(matches!(registry.create(draft("  ")), Err(ApiError::InvalidInput(_))));
    }

    #[test]
    fn resolve_unknown_bot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BotRegistry::with_path(dir.path().join("bots.yaml"));
        assert!(matches!(registry.resolve("ghost"), Err(ApiError::BotNotFound(_))));
        assert!(matches!(
            registry.update("ghost", BotPatch::default()),
            Err(ApiError::BotNotFound(_))
        ));
        assert!(matches!(registry.delete("ghost"), Err(ApiError::BotNotFound(_))));
    }

    #[test]
    fn update_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BotRegistry::with_path(dir.path().join("bots.yaml"));
        let bot = registry.create(draft("Support")).unwrap();

        let updated = registry
            .update(
                &bot.id,
                BotPatch {
                    greeting_message: Some("Hi there".into()),
                    system_prompt: Some("You are terse.".into()),
                    ..BotPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.created_at, bot.created_at);
        assert!(updated.updated_at >= bot.updated_at);
        assert_eq!(updated.greeting_message, "Hi there");
        assert_eq!(updated.system_prompt.as_deref(), Some("You are terse."));
    }

    #[test]
    fn list_pages_newest_first_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BotRegistry::with_path(dir.path().join("bots.yaml"));
        let mut ids = Vec::new();
        for i in 0..5 {
            let enabled = i % 2 == 0;
            let bot = registry
                .create(BotDraft {
                    knowledge_base_enabled: Some(enabled),
                    ..draft(&format!("bot {i}"))
                })
                .unwrap();
            ids.push(bot.id);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let first = registry.list(1, 2).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.bots[0].bot.id, ids[4]);
        assert_eq!(first.bots[0].embed_url, format!("/bot/{}", ids[4]));
        let last = registry.list(3, 2).unwrap();
        assert_eq!(last.bots.len(), 1);
        assert_eq!(last.bots[0].bot.id, ids[0]);
        assert!(registry.list(0, 2).is_err());

        assert_eq!(
            registry.stats(),
            BotStats {
                total: 5,
                knowledge_enabled: 3,
                knowledge_disabled: 2
            }
        );

        registry.delete(&ids[0]).unwrap();
        assert_eq!(registry.stats().total, 4);
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bots.yaml");
        fs::write(&path, "bots: [this is: not: valid").unwrap();
        let registry = BotRegistry::with_path(&path);
        assert_eq!(registry.stats().total, 0);
    }
}
