use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::paths::AppPaths;
use super::settings::AppSettings;
use super::validation::validate_config;
use crate::core::errors::ApiError;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 8] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "credential",
    "private_key",
    "bearer",
    "access_key",
];

const SENSITIVE_WHITELIST: [&str; 2] = ["max_tokens", "num_predict_tokens"];

/// YAML-backed configuration: `config.yml` for public values, `secrets.yaml` for
/// anything whose key looks sensitive. Both are merged on load.
#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("SERVICEBOT_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.user_data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    fn config_write_path(&self) -> PathBuf {
        if let Ok(path) = env::var("SERVICEBOT_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        self.paths.user_data_dir.join("config.yml")
    }

    pub fn load_config(&self) -> Result<Value, ApiError> {
        let public_config = load_yaml_file(&self.config_path());
        let secrets_config = load_yaml_file(&self.paths.secrets_path);
        Ok(deep_merge(&public_config, &secrets_config))
    }

    /// Typed view of the merged configuration with environment overrides applied.
    pub fn settings(&self) -> Result<AppSettings, ApiError> {
        let raw = self.load_config()?;
        validate_config(&raw)?;
        let mut settings = AppSettings::from_value(&raw)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn update_config(&self, patch: Value, merge: bool) -> Result<Value, ApiError> {
        let current = self.load_config()?;
        let restored = restore_redacted_values(&patch, &current);
        let to_save = if merge {
            deep_merge(&current, &restored)
        } else {
            restored
        };

        validate_config(&to_save)?;
        self.save(&to_save)?;
        tracing::info!("Configuration updated");
        Ok(redact_sensitive_values(&to_save))
    }

    pub fn redacted(&self) -> Result<Value, ApiError> {
        Ok(redact_sensitive_values(&self.load_config()?))
    }

    fn save(&self, config: &Value) -> Result<(), ApiError> {
        let (public_config, secrets_config) = split_config(config);
        write_yaml(&self.config_write_path(), &public_config)?;
        write_yaml(&self.paths.secrets_path, &secrets_config)
    }
}

fn load_yaml_file(path: &Path) -> Value {
    let Ok(contents) = fs::read_to_string(path) else {
        return Value::Object(Map::new());
    };
    match serde_yaml::from_str::<Value>(&contents) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => Value::Object(Map::new()),
        Err(err) => {
            tracing::warn!("Ignoring unreadable config file {}: {}", path.display(), err);
            Value::Object(Map::new())
        }
    }
}

fn write_yaml(path: &Path, value: &Value) -> Result<(), ApiError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ApiError::internal)?;
    }
    let yaml = serde_yaml::to_string(value).map_err(ApiError::internal)?;
    fs::write(path, yaml).map_err(ApiError::internal)
}

fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

fn split_config(config: &Value) -> (Value, Value) {
    let Value::Object(map) = config else {
        return (config.clone(), Value::Object(Map::new()));
    };

    let mut public_map = Map::new();
    let mut secret_map = Map::new();
    for (key, value) in map {
        if value.is_object() {
            let (public_sub, secret_sub) = split_config(value);
            if !is_empty_object(&public_sub) {
                public_map.insert(key.clone(), public_sub);
            }
            if !is_empty_object(&secret_sub) {
                secret_map.insert(key.clone(), secret_sub);
            }
        } else if is_sensitive_key(key) && !value.is_null() {
            secret_map.insert(key.clone(), value.clone());
        } else {
            public_map.insert(key.clone(), value.clone());
        }
    }
    (Value::Object(public_map), Value::Object(secret_map))
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let redacted = if is_sensitive_key(key) && !val.is_null() {
                        Value::String(REDACT_PLACEHOLDER.to_string())
                    } else {
                        redact_sensitive_values(val)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn restore_redacted_values(incoming: &Value, original: &Value) -> Value {
    let Value::Object(map) = incoming else {
        return incoming.clone();
    };

    let mut restored = Map::new();
    for (key, value) in map {
        let previous = original.get(key);
        if value.as_str() == Some(REDACT_PLACEHOLDER) {
            if let Some(previous) = previous {
                restored.insert(key.clone(), previous.clone());
            }
            continue;
        }
        let next = if value.is_object() {
            restore_redacted_values(value, previous.unwrap_or(&Value::Null))
        } else {
            value.clone()
        };
        restored.insert(key.clone(), next);
    }
    Value::Object(restored)
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST.contains(&key_lower.as_str()) {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}

fn is_empty_object(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_in(dir: &Path) -> ConfigService {
        let paths = AppPaths::with_data_dir(dir.to_path_buf(), dir.join("data"));
        ConfigService::new(Arc::new(paths))
    }

    #[test]
    fn deep_merge_overrides_scalars_and_keeps_siblings() {
        let base = json!({ "llm": { "chat_model": "a", "base_url": "http://x" }, "n": 1 });
        let overlay = json!({ "llm": { "chat_model": "b" } });

        assert_eq!(
            deep_merge(&base, &overlay),
            json!({ "llm": { "chat_model": "b", "base_url": "http://x" }, "n": 1 })
        );
    }

    #[test]
    fn api_key_goes_to_secrets_and_is_redacted() {
        let config = json!({ "llm": { "api_key": "sk-1", "max_tokens": 512 } });

        let (public_config, secrets) = split_config(&config);
        assert_eq!(public_config, json!({ "llm": { "max_tokens": 512 } }));
        assert_eq!(secrets, json!({ "llm": { "api_key": "sk-1" } }));
        assert_eq!(
            redact_sensitive_values(&config),
            json!({ "llm": { "api_key": "****", "max_tokens": 512 } })
        );
    }

    #[test]
    fn update_keeps_secret_when_placeholder_is_sent_back() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        service
            .update_config(json!({ "llm": { "api_key": "sk-1" } }), true)
            .unwrap();

        service
            .update_config(json!({ "llm": { "api_key": "****", "chat_model": "m" } }), true)
            .unwrap();

        let loaded = service.load_config().unwrap();
        assert_eq!(loaded["llm"]["api_key"], "sk-1");
        assert_eq!(loaded["llm"]["chat_model"], "m");
        let public_text = fs::read_to_string(dir.path().join("data").join("config.yml")).unwrap();
        assert!(!public_text.contains("sk-1"));
    }

    #[test]
    fn invalid_update_is_rejected_and_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());

        let err = service
            .update_config(json!({ "retrieval": { "top_k": 0 } }), true)
            .unwrap_err();

        assert!(matches!(err, ApiError::InvalidInput(_)));
        assert!(!dir.path().join("data").join("config.yml").exists());
    }

    #[test]
    fn hand_edited_config_is_validated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path());
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(
            dir.path().join("data").join("config.yml"),
            "chat:\n  reasoning_open: \"\"\n  reasoning_close: \"\"\n",
        )
        .unwrap();

        let err = service.settings().unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }
}
