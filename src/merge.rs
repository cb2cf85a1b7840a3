//! Pure merge functions for the auth and config documents.
//!
//! These take a borrowed existing document and return a new merged one; the
//! I/O layer handles reading and writing. Invariants:
//!   - Never mutate the input document.
//!   - Preserve every key this tool does not own.
//!   - Validate inputs strictly before touching the document.
//!   - Merging the same facts twice yields the same document as once.

use std::collections::BTreeMap;
use std::collections::HashSet;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::{Result, SetupError};
use crate::io::{json_type_name, JsonObject};

/// API routing metadata for a model entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelApi {
    /// Provider-specific API model/deployment identifier.
    pub id: String,
    /// Provider implementation package identifier.
    pub npm: String,
}

/// A custom model entry inside a provider block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Display name for the model.
    pub name: String,
    /// Optional API override (e.g. deployment casing/mapping).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<ModelApi>,
}

/// Inputs for a provider config merge.
#[derive(Debug, Clone)]
pub struct ProviderMergeSpec {
    /// Provider ID to insert or replace.
    pub provider_id: String,
    /// Azure resource name, used to construct the baseURL.
    pub resource_name: String,
    /// Model names to whitelist (normalized to lowercase on merge).
    pub whitelist: Vec<String>,
    /// Provider IDs to append to `disabled_providers`.
    pub disabled_providers: Vec<String>,
    /// Optional per-model overrides keyed by model ID.
    pub models: Option<BTreeMap<String, ModelEntry>>,
}

// Azure Cognitive Services resource name: 1-64 chars, alphanumeric plus
// hyphens, alphanumeric at both ends. No dots, slashes, spaces, or specials.
fn resource_name_re() -> Regex {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]{0,62}[a-zA-Z0-9]$|^[a-zA-Z0-9]$").unwrap()
}

/// Validate an Azure resource name against the naming rules.
///
/// # Errors
///
/// [`SetupError::Validation`] when the name is empty, too long, or contains
/// characters outside the allowed set.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() || !resource_name_re().is_match(name) {
        return Err(SetupError::Validation {
            field: "resource_name".to_string(),
            detail: format!(
                "Invalid Azure resource name {name:?}. Must be 1-64 alphanumeric \
                 characters and hyphens, starting and ending with alphanumeric."
            ),
        });
    }
    Ok(())
}

/// Merge a single provider auth entry into an existing auth document.
///
/// The provider's entry is replaced wholesale with `{type: "api", key}`;
/// every other entry passes through unchanged. The key value never appears
/// in an error.
pub fn merge_auth(existing: &JsonObject, provider_id: &str, api_key: &str) -> Result<JsonObject> {
    if provider_id.is_empty() {
        return Err(empty_field("provider_id"));
    }
    if api_key.is_empty() {
        return Err(empty_field("api_key"));
    }

    let mut result = existing.clone();
    result.insert(
        provider_id.to_string(),
        json!({ "type": "api", "key": api_key }),
    );
    Ok(result)
}

/// Merge provider config into an existing config document.
///
/// `disabled_providers` becomes the union of existing and supplied entries,
/// de-duplicated, existing order preserved, new entries appended. The
/// provider's block is replaced wholesale: `options.baseURL` from the
/// resource name, the whitelist lowercased, de-duplicated, and sorted, and
/// the models overrides when supplied. Other providers and unrelated
/// top-level keys pass through unchanged.
pub fn merge_config(existing: &JsonObject, spec: &ProviderMergeSpec) -> Result<JsonObject> {
    if spec.provider_id.is_empty() {
        return Err(empty_field("provider_id"));
    }
    validate_resource_name(&spec.resource_name)?;

    let mut result = existing.clone();

    let merged_dp =
        merge_disabled_providers(result.get("disabled_providers"), &spec.disabled_providers)?;
    result.insert(
        "disabled_providers".to_string(),
        Value::Array(merged_dp.into_iter().map(Value::String).collect()),
    );

    let mut providers = match result.get("provider") {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(SetupError::InvalidSchema {
                path: "opencode.json".to_string(),
                detail: format!("provider must be an object, got {}", json_type_name(other)),
            })
        }
        None => Map::new(),
    };

    let base_url = format!(
        "https://{}.cognitiveservices.azure.com/openai",
        spec.resource_name
    );
    let whitelist = normalize_whitelist(&spec.whitelist);

    let mut block = Map::new();
    block.insert("options".to_string(), json!({ "baseURL": base_url }));
    block.insert(
        "whitelist".to_string(),
        Value::Array(whitelist.into_iter().map(Value::String).collect()),
    );
    if let Some(models) = spec.models.as_ref().filter(|models| !models.is_empty()) {
        let value = serde_json::to_value(models).map_err(|err| SetupError::Io {
            path: "opencode.json".to_string(),
            source: std::io::Error::other(err),
        })?;
        block.insert("models".to_string(), value);
    }
    providers.insert(spec.provider_id.clone(), Value::Object(block));
    result.insert("provider".to_string(), Value::Object(providers));

    Ok(result)
}

fn empty_field(field: &str) -> SetupError {
    SetupError::Validation {
        field: field.to_string(),
        detail: "Must not be empty".to_string(),
    }
}

/// Extract, validate, and union the `disabled_providers` lists.
fn merge_disabled_providers(
    existing: Option<&Value>,
    new_providers: &[String],
) -> Result<Vec<String>> {
    let mut merged: Vec<String> = Vec::new();
    match existing {
        None => {}
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(id) => merged.push(id.clone()),
                    other => {
                        return Err(SetupError::InvalidSchema {
                            path: "opencode.json".to_string(),
                            detail: format!(
                                "disabled_providers contains non-string: {}",
                                json_type_name(other)
                            ),
                        })
                    }
                }
            }
        }
        Some(other) => {
            return Err(SetupError::InvalidSchema {
                path: "opencode.json".to_string(),
                detail: format!(
                    "disabled_providers must be an array, got {}. This may indicate \
                     a hand-edited or corrupt config file.",
                    json_type_name(other)
                ),
            })
        }
    }
    merged.extend(new_providers.iter().cloned());
    Ok(dedup_preserve_order(merged))
}

/// Lowercase, de-duplicate, and sort a whitelist.
fn normalize_whitelist(items: &[String]) -> Vec<String> {
    let lowered: Vec<String> = items.iter().map(|item| item.to_lowercase()).collect();
    let mut out = dedup_preserve_order(lowered);
    out.sort();
    out
}

/// Remove duplicates while preserving first-occurrence order.
fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
