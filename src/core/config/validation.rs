use serde_json::{Map, Value};

use crate::core::errors::ApiError;

pub fn validate_config(config: &Value) -> Result<(), ApiError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 0, u16::MAX as u64)?;
        validate_string_array_field(server, "server.allowed_origins", "allowed_origins")?;
    }

    if let Some(logging) = expect_optional_object(root, "logging")? {
        validate_optional_string_field(logging, "logging.level", "level")?;
    }

    if let Some(llm) = expect_optional_object(root, "llm")? {
        validate_one_of(llm, "llm.provider", "provider", &["ollama", "openai"])?;
        validate_optional_string_field(llm, "llm.base_url", "base_url")?;
        validate_optional_string_field(llm, "llm.chat_model", "chat_model")?;
        validate_optional_string_field(llm, "llm.embedding_model", "embedding_model")?;
        validate_optional_string_field(llm, "llm.api_key", "api_key")?;
        validate_optional_string_field(llm, "llm.keep_alive", "keep_alive")?;
        validate_u64_field(llm, "llm.chat_timeout_secs", "chat_timeout_secs", 1, 3_600)?;
        validate_u64_field(llm, "llm.embed_timeout_secs", "embed_timeout_secs", 1, 3_600)?;
        validate_u64_field(llm, "llm.max_tokens", "max_tokens", 1, 1_000_000)?;
        validate_f64_field(llm, "llm.temperature", "temperature", 0.0, 2.0)?;
    }

    if let Some(knowledge) = expect_optional_object(root, "knowledge")? {
        validate_one_of(knowledge, "knowledge.backend", "backend", &["sqlite", "memory"])?;
        validate_u64_field(
            knowledge,
            "knowledge.embedding_dimension",
            "embedding_dimension",
            1,
            65_536,
        )?;
    }

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        validate_u64_field(retrieval, "retrieval.top_k", "top_k", 1, 100)?;
        validate_f64_field(retrieval, "retrieval.min_similarity", "min_similarity", -1.0, 1.0)?;
        validate_u64_field(
            retrieval,
            "retrieval.max_prompt_chars",
            "max_prompt_chars",
            1,
            10_000_000,
        )?;
        validate_u64_field(
            retrieval,
            "retrieval.max_history_turns",
            "max_history_turns",
            0,
            1_000,
        )?;
        validate_bool_field(retrieval, "retrieval.fail_open", "fail_open")?;
    }

    if let Some(chat) = expect_optional_object(root, "chat")? {
        validate_required_if_present(chat, "chat.reasoning_open", "reasoning_open")?;
        validate_required_if_present(chat, "chat.reasoning_close", "reasoning_close")?;
        validate_bool_field(chat, "chat.fallback_on_error", "fallback_on_error")?;
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ApiError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(config_type_error(key, "object")),
        None => Ok(None),
    }
}

fn validate_bool_field(section: &Map<String, Value>, path: &str, key: &str) -> Result<(), ApiError> {
    match section.get(key) {
        None | Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(config_type_error(path, "boolean")),
    }
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(out_of_range(path, min, max));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if !(min..=max).contains(&number) {
        return Err(out_of_range(path, min, max));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    match section.get(key) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(config_type_error(path, "string")),
    }
}

fn validate_required_if_present(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    match section.get(key) {
        None => Ok(()),
        Some(Value::String(text)) if !text.is_empty() => Ok(()),
        Some(_) => Err(config_type_error(path, "non-empty string")),
    }
}

fn validate_one_of(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    match value.as_str() {
        Some(text) if allowed.contains(&text) => Ok(()),
        _ => Err(ApiError::InvalidInput(format!(
            "Invalid config at '{}': expected one of {}",
            path,
            allowed.join(", ")
        ))),
    }
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    if items.iter().all(Value::is_string) {
        Ok(())
    } else {
        Err(config_type_error(path, "array of strings"))
    }
}

fn out_of_range<T: std::fmt::Display>(path: &str, min: T, max: T) -> ApiError {
    ApiError::InvalidInput(format!(
        "Invalid config at '{}': must be between {} and {}",
        path, min, max
    ))
}

fn config_type_error(path: &str, expected: &str) -> ApiError {
    ApiError::InvalidInput(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
