//! LLM-parameter handling at the provider boundary.
//!
//! Callers supply parameters in one canonical camelCase casing. Each adapter
//! converts to its wire casing here, so the rest of the pipeline never
//! thinks about provider spelling differences.

use serde_json::Map;

use crate::{
    args::LlmParams,
    completion::camel_to_snake,
    prelude::*,
};

/// Keys consumed by the pipeline itself rather than forwarded to providers.
const INTERNAL_KEYS: &[&str] = &["logprobs"];

/// Did the caller ask for per-token logprobs?
pub fn logprobs_requested(params: &LlmParams) -> bool {
    params.get("logprobs").and_then(Value::as_bool).unwrap_or(false)
}

/// Convert canonical camelCase parameters to the snake_case wire casing used
/// by OpenAI-style APIs, dropping keys the pipeline consumes itself.
pub fn to_snake_case_params(params: &LlmParams) -> Map<String, Value> {
    params
        .iter()
        .filter(|(key, _)| !INTERNAL_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (camel_to_snake(key), value.clone()))
        .collect()
}

/// Is this an OpenAI reasoning-family model (`o1`/`o3`/`o4`/`gpt-5`)?
///
/// These models accept `max_completion_tokens` rather than `max_tokens`.
fn is_reasoning_model(model: &str) -> bool {
    if model.starts_with("gpt-5") {
        return true;
    }
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Translate `max_tokens` for models that refuse it.
pub fn translate_token_limit(params: &mut Map<String, Value>, model: &str) {
    if !is_reasoning_model(model) {
        return;
    }
    if let Some(value) = params.remove("max_tokens") {
        params.entry("max_completion_tokens").or_insert(value);
    }
}

/// Read one numeric knob out of the canonical params.
pub fn numeric_param(params: &LlmParams, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}
