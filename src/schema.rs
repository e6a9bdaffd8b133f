//! Schema support.
//!
//! The caller's JSON Schema is treated as plain data. [`split_schema`]
//! partitions its top-level properties into a per-page subset and a
//! full-document subset; the extraction driver runs one task per side.

use serde_json::Map;

use crate::{error::ZeroxError, prelude::*};

/// Get the title of a JSON Schema, or `"ResponseFormat"` if not present.
pub fn schema_title(schema: &Value) -> String {
    schema
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("ResponseFormat")
        .to_owned()
}

/// The two sub-schemas produced by partitioning the user schema.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitSchema {
    /// Schema over the properties extracted once per page, if any.
    pub per_page: Option<Value>,

    /// Schema over the properties extracted once for the whole document,
    /// if any.
    pub full_doc: Option<Value>,
}

/// Partition `schema` into per-page and full-document sub-schemas.
///
/// Each side is the original schema restricted to its subset of top-level
/// properties, with `required` filtered down to the entries that remain
/// satisfiable. Property names in `extract_per_page` that don't exist in the
/// schema are ignored. An empty side is omitted entirely, so a schema with
/// no per-page properties produces `per_page: None` and the driver spawns no
/// per-page tasks (and symmetrically for the full-document side).
pub fn split_schema(schema: &Value, extract_per_page: &[String]) -> Result<SplitSchema> {
    let object = schema.as_object().ok_or_else(|| {
        anyhow!(ZeroxError::Schema("schema must be a JSON object".into()))
    })?;
    let properties = object
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            anyhow!(ZeroxError::Schema(
                "schema must have top-level properties".into()
            ))
        })?;

    let mut per_page = Map::new();
    let mut full_doc = Map::new();
    for (name, prop) in properties {
        if extract_per_page.iter().any(|p| p == name) {
            per_page.insert(name.clone(), prop.clone());
        } else {
            full_doc.insert(name.clone(), prop.clone());
        }
    }

    Ok(SplitSchema {
        per_page: restrict_to(object, per_page),
        full_doc: restrict_to(object, full_doc),
    })
}

/// Rebuild the schema over `subset`, or `None` when the subset is empty.
fn restrict_to(original: &Map<String, Value>, subset: Map<String, Value>) -> Option<Value> {
    if subset.is_empty() {
        return None;
    }
    let mut schema = original.clone();
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let kept = required
            .iter()
            .filter(|name| {
                name.as_str()
                    .is_some_and(|name| subset.contains_key(name))
            })
            .cloned()
            .collect::<Vec<_>>();
        schema.insert("required".into(), Value::Array(kept));
    }
    schema.insert("properties".into(), Value::Object(subset));
    Some(Value::Object(schema))
}
