//! Normalizing raw provider responses.
//!
//! Vision models occasionally wrap their markdown in code fences despite
//! being told not to, and extraction endpoints sometimes return JSON text
//! rather than an object. Everything downstream assumes clean content, so
//! both fixes live here rather than in each provider adapter.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Map;

use crate::prelude::*;

/// Matches a response wrapped in a single outer code fence, with or without
/// a `markdown`/`html` language tag.
static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:markdown|html)?\s*\n?(.*?)\n?```\s*$")
        .expect("built-in regex should be valid")
});

/// OCR content after fence stripping, plus its visible length.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProcessedOcr {
    /// The cleaned markdown.
    pub content: String,

    /// Character count of `content`.
    pub content_length: usize,
}

/// Strip outer code fences from OCR output and compute the content length.
pub fn process_ocr_content(raw: &str) -> ProcessedOcr {
    let trimmed = raw.trim();
    let content = match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].trim().to_owned(),
        None => trimmed.to_owned(),
    };
    let content_length = content.chars().count();
    ProcessedOcr {
        content,
        content_length,
    }
}

/// Normalize an extraction response into the shape the schema promises.
///
/// Providers in strict-JSON mode may hand back a JSON string rather than a
/// parsed object, and a model may answer `null` for an empty page. When the
/// schema describes an object, absence becomes `{}` so downstream merging
/// never has to special-case it.
pub fn process_extraction_value(raw: Value, schema_is_object: bool) -> Result<Value> {
    let parsed = match raw {
        Value::String(text) => serde_json::from_str::<Value>(&text)
            .with_context(|| format!("extraction response was not valid JSON: {text:?}"))?,
        other => other,
    };
    if schema_is_object && !parsed.is_object() {
        if parsed.is_null() {
            return Ok(Value::Object(Map::new()));
        }
        return Err(anyhow!(
            "extraction response was not an object: {parsed}"
        ));
    }
    Ok(parsed)
}

/// Does this schema declare a top-level object?
pub fn schema_is_object(schema: &Value) -> bool {
    schema.get("type").and_then(Value::as_str) == Some("object")
        || schema.get("properties").is_some()
}

/// Convert a `snake_case` identifier to `camelCase`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Convert a `camelCase` identifier to `snake_case`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_uppercase() {
            out.push('_');
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recursively rewrite every object key in a provider response to
/// `camelCase`. Applied to token-logprob payloads before they leave the
/// adapter layer, so callers see one casing regardless of provider.
pub fn normalize_keys_to_camel(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(snake_to_camel(&key), normalize_keys_to_camel(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items.into_iter().map(normalize_keys_to_camel).collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        let got = process_ocr_content("```markdown\n# Title\nBody\n```");
        assert_eq!(got.content, "# Title\nBody");
        assert_eq!(got.content_length, "# Title\nBody".chars().count());
    }

    #[test]
    fn strips_bare_fence() {
        let got = process_ocr_content("```\n# Title\n```");
        assert_eq!(got.content, "# Title");
    }

    #[test]
    fn strips_html_fence() {
        let got = process_ocr_content("```html\n<table></table>\n```");
        assert_eq!(got.content, "<table></table>");
    }

    #[test]
    fn passes_unfenced_content_through() {
        let got = process_ocr_content("  # Title\n\nBody  ");
        assert_eq!(got.content, "# Title\n\nBody");
    }

    #[test]
    fn inner_fences_survive() {
        let input = "Intro\n```rust\nfn main() {}\n```\nOutro";
        let got = process_ocr_content(input);
        assert_eq!(got.content, input);
    }

    #[test]
    fn content_length_counts_chars_not_bytes() {
        let got = process_ocr_content("héllo");
        assert_eq!(got.content_length, 5);
    }

    #[test]
    fn extraction_parses_json_strings() {
        let got =
            process_extraction_value(json!(r#"{"total": 12}"#), true).unwrap();
        assert_eq!(got, json!({"total": 12}));
    }

    #[test]
    fn extraction_null_becomes_empty_object() {
        let got = process_extraction_value(Value::Null, true).unwrap();
        assert_eq!(got, json!({}));
    }

    #[test]
    fn extraction_rejects_non_object_for_object_schema() {
        assert!(process_extraction_value(json!([1, 2]), true).is_err());
    }

    #[test]
    fn casing_round_trip() {
        assert_eq!(snake_to_camel("top_logprobs"), "topLogprobs");
        assert_eq!(camel_to_snake("maxCompletionTokens"), "max_completion_tokens");
        assert_eq!(snake_to_camel("logprob"), "logprob");
    }

    #[test]
    fn normalizes_nested_logprob_keys() {
        let raw = json!({
            "content": [{"token": "a", "top_logprobs": [{"log_prob": -0.5}]}]
        });
        let got = normalize_keys_to_camel(raw);
        assert_eq!(
            got,
            json!({"content": [{"token": "a", "topLogprobs": [{"logProb": -0.5}]}]})
        );
    }
}
