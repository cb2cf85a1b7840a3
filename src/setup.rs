//! Setup workflow: discovery, merge, and atomic persistence.
//!
//! The workflow is linear. Validation and discovery run before any disk
//! mutation; both documents are then read, merged, backed up, and written
//! inside one lock scope, so a concurrent run either sees none of the
//! changes or all of them.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use regex_lite::Regex;

use crate::discovery::{AccountMatch, AzCli, Deployment};
use crate::errors::{Result, SetupError};
use crate::io::{atomic_write_json, read_json_object};
use crate::locking::{backup_file, FileLock, DEFAULT_LOCK_TIMEOUT};
use crate::merge::{merge_auth, merge_config, ModelApi, ModelEntry, ProviderMergeSpec};
use crate::paths::{ensure_parent_dir, opencode_auth_path, opencode_config_path};

const AZURE_MODEL_NPM: &str = "@ai-sdk/azure";

/// Where the API key comes from. A plain `--key VALUE` argument is
/// deliberately unsupported: process listings leak argument vectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Read from the named environment variable.
    Env(String),
    /// Prompt on the terminal with echo disabled.
    Stdin,
    /// Fetch the discovered account's primary key via az.
    Azure,
}

/// Parameters for the setup workflow.
#[derive(Debug, Clone)]
pub struct SetupParams {
    /// Resource to configure. `None` auto-picks the account with the most
    /// deployments.
    pub resource_name: Option<String>,
    /// OpenCode provider ID to configure.
    pub provider_id: String,
    /// Model names to whitelist. Empty means everything deployed.
    pub whitelist: Vec<String>,
    /// Provider IDs to append to `disabled_providers`.
    pub disabled_providers: Vec<String>,
    /// Optional subscription to scope discovery.
    pub subscription_id: Option<String>,
    /// az binary to invoke.
    pub az_program: String,
    /// Per-command az timeout.
    pub az_timeout: Duration,
    /// API key source.
    pub key_source: KeySource,
    /// Override for the config file path.
    pub config_path: Option<PathBuf>,
    /// Override for the auth file path.
    pub auth_path: Option<PathBuf>,
    /// Time to wait for each file lock.
    pub lock_timeout: Duration,
}

impl SetupParams {
    /// Parameters for configuring `provider_id` with defaults everywhere
    /// else: real az binary, 60s az timeout, env key source, default paths.
    pub fn new(provider_id: impl Into<String>) -> SetupParams {
        SetupParams {
            resource_name: None,
            provider_id: provider_id.into(),
            whitelist: Vec::new(),
            disabled_providers: Vec::new(),
            subscription_id: None,
            az_program: "az".to_string(),
            az_timeout: Duration::from_secs(60),
            key_source: KeySource::Env("AZURE_OPENAI_API_KEY".to_string()),
            config_path: None,
            auth_path: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Outcome of a successful setup run, for the CLI to report.
#[derive(Debug)]
pub struct SetupOutcome {
    pub provider_id: String,
    pub resource_name: String,
    pub config_path: PathBuf,
    pub auth_path: PathBuf,
    /// Which account was selected and where else it was seen.
    pub account_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionReason {
    Specified,
    AutoPicked,
}

struct DiscoveredProvider {
    account: AccountMatch,
    whitelist: Vec<String>,
    models: Option<BTreeMap<String, ModelEntry>>,
    message: String,
}

/// Execute the setup workflow.
///
/// Key acquisition and discovery happen first; nothing touches disk until
/// both documents are merged in memory. The config lock is always taken
/// before the auth lock, so two concurrent runs cannot deadlock on swapped
/// acquisition order. Both locks release on every exit path.
pub fn run_setup(params: &SetupParams) -> Result<SetupOutcome> {
    let config_path = match &params.config_path {
        Some(path) => path.clone(),
        None => opencode_config_path()?,
    };
    let auth_path = match &params.auth_path {
        Some(path) => path.clone(),
        None => opencode_auth_path()?,
    };

    let az = AzCli::new(params.az_program.clone(), params.az_timeout);

    let early_key = match &params.key_source {
        KeySource::Env(var) => Some(key_from_env(var)?),
        KeySource::Stdin => Some(key_from_prompt()?),
        KeySource::Azure => None,
    };

    let discovered = discover(&az, params)?;

    let api_key = match early_key {
        Some(key) => key,
        None => {
            let account = &discovered.account;
            az.get_api_key(
                &account.account.resource_group,
                &account.account.name,
                &account.subscription.id,
            )?
        }
    };

    let _config_lock = FileLock::acquire(&config_path, params.lock_timeout)?;
    let _auth_lock = FileLock::acquire(&auth_path, params.lock_timeout)?;

    let existing_config = read_json_object(&config_path)?;
    let existing_auth = read_json_object(&auth_path)?;

    let new_config = merge_config(
        &existing_config,
        &ProviderMergeSpec {
            provider_id: params.provider_id.clone(),
            resource_name: discovered.account.account.name.clone(),
            whitelist: discovered.whitelist.clone(),
            disabled_providers: params.disabled_providers.clone(),
            models: discovered.models.clone(),
        },
    )?;
    let new_auth = merge_auth(&existing_auth, &params.provider_id, &api_key)?;

    if config_path.exists() {
        let backup = backup_file(&config_path)?;
        tracing::debug!(backup = %backup.display(), "backed up existing config");
    }
    if auth_path.exists() {
        let backup = backup_file(&auth_path)?;
        tracing::debug!(backup = %backup.display(), "backed up existing auth file");
    }

    ensure_parent_dir(&config_path, false)?;
    ensure_parent_dir(&auth_path, true)?;
    atomic_write_json(&config_path, &new_config, false)?;
    atomic_write_json(&auth_path, &new_auth, true)?;

    Ok(SetupOutcome {
        provider_id: params.provider_id.clone(),
        resource_name: discovered.account.account.name.clone(),
        config_path,
        auth_path,
        account_message: discovered.message,
    })
}

fn key_from_env(var: &str) -> Result<String> {
    if var.is_empty() {
        return Err(SetupError::Validation {
            field: "key_env".to_string(),
            detail: "No key source specified".to_string(),
        });
    }
    match env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(SetupError::Validation {
            field: "api_key".to_string(),
            detail: format!("Environment variable '{var}' is not set or empty"),
        }),
    }
}

fn key_from_prompt() -> Result<String> {
    let key = dialoguer::Password::new()
        .with_prompt("Enter API key")
        .allow_empty_password(true)
        .interact()
        .map_err(|err| SetupError::Validation {
            field: "api_key".to_string(),
            detail: format!("Failed to read key from stdin: {err}"),
        })?;
    if key.is_empty() {
        return Err(SetupError::Validation {
            field: "api_key".to_string(),
            detail: "Empty key from stdin".to_string(),
        });
    }
    Ok(key)
}

/// Resolve the target account, its deployments, the effective whitelist,
/// and the models overrides.
fn discover(az: &AzCli, params: &SetupParams) -> Result<DiscoveredProvider> {
    let (chosen, others, reason) = match &params.resource_name {
        Some(name) => {
            let (chosen, others) =
                az.find_cognitive_account(name, params.subscription_id.as_deref())?;
            (chosen, others, SelectionReason::Specified)
        }
        None => {
            let (chosen, others) =
                az.pick_best_cognitive_account(params.subscription_id.as_deref())?;
            (chosen, others, SelectionReason::AutoPicked)
        }
    };

    let deployments = az.list_deployments(
        &chosen.account.resource_group,
        &chosen.account.name,
        &chosen.subscription.id,
    )?;
    if deployments.is_empty() {
        return Err(SetupError::Validation {
            field: "deployments".to_string(),
            detail: format!(
                "No deployments found on resource '{}' (subscription {}).",
                chosen.account.name, chosen.subscription.id
            ),
        });
    }

    let (available_sorted, available) = available_models(&deployments);
    let whitelist = resolve_whitelist(&params.whitelist, &available_sorted, &available)?;
    let models = model_overrides(&deployments);
    let message = account_message(reason, &chosen, &others);

    Ok(DiscoveredProvider {
        account: chosen,
        whitelist,
        models,
        message,
    })
}

// OpenCode model IDs are lowercase (models.dev); anything outside this
// shape is dropped rather than written into the config.
fn safe_model_id_re() -> Regex {
    Regex::new(r"^[a-z0-9][a-z0-9._-]*$").unwrap()
}

/// Model IDs available on the account: lowercased deployment and catalog
/// names, de-duplicated, sorted.
fn available_models(deployments: &[Deployment]) -> (Vec<String>, HashSet<String>) {
    let id_re = safe_model_id_re();
    let mut seen = HashSet::new();
    let mut models = Vec::new();
    for deployment in deployments {
        let candidates = [Some(deployment.name.as_str()), deployment.model.as_deref()];
        for raw in candidates.into_iter().flatten() {
            if raw.is_empty() {
                continue;
            }
            let id = raw.to_lowercase();
            if !id_re.is_match(&id) {
                continue;
            }
            if seen.insert(id.clone()) {
                models.push(id);
            }
        }
    }
    models.sort();
    (models, seen)
}

/// Normalize the requested whitelist and check it against what is deployed.
/// An empty request whitelists everything available.
fn resolve_whitelist(
    desired: &[String],
    available_sorted: &[String],
    available: &HashSet<String>,
) -> Result<Vec<String>> {
    if desired.is_empty() {
        return Ok(available_sorted.to_vec());
    }

    let mut seen = HashSet::new();
    let mut whitelist = Vec::new();
    for entry in desired {
        let id = entry.to_lowercase();
        if seen.insert(id.clone()) {
            whitelist.push(id);
        }
    }

    let missing: Vec<String> = whitelist
        .iter()
        .filter(|id| !available.contains(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        let deployed_preview = available_sorted
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        return Err(SetupError::Validation {
            field: "whitelist".to_string(),
            detail: format!(
                "Unknown model(s): {}. Deployed (first 10): {deployed_preview}",
                missing.join(", ")
            ),
        });
    }

    Ok(whitelist)
}

/// Case-sensitive routing overrides for OpenCode's `/openai/v1/responses`
/// path: `api.id` carries the exact Azure deployment name, and catalog
/// model IDs map onto their deployment when the two differ.
fn model_overrides(deployments: &[Deployment]) -> Option<BTreeMap<String, ModelEntry>> {
    let id_re = safe_model_id_re();
    let mut models: BTreeMap<String, ModelEntry> = BTreeMap::new();

    for deployment in deployments {
        let dep_raw = deployment.name.as_str();
        let dep_id = dep_raw.to_lowercase();

        let dep_known = id_re.is_match(&dep_id);
        if dep_known {
            models.entry(dep_id.clone()).or_insert_with(|| ModelEntry {
                name: format!("{dep_raw} (Azure)"),
                api: Some(ModelApi {
                    id: dep_raw.to_string(),
                    npm: AZURE_MODEL_NPM.to_string(),
                }),
            });
        }

        let Some(model_raw) = deployment.model.as_deref().filter(|m| !m.is_empty()) else {
            continue;
        };
        let model_id = model_raw.to_lowercase();
        if !id_re.is_match(&model_id) {
            continue;
        }

        // Prefer the catalog display name over the deployment name.
        if dep_known {
            if let Some(entry) = models.get_mut(&dep_id) {
                entry.name = format!("{model_raw} (Azure)");
            }
        }

        if model_id != dep_id {
            models.entry(model_id).or_insert_with(|| ModelEntry {
                name: format!("{model_raw} (Azure)"),
                api: Some(ModelApi {
                    id: dep_raw.to_string(),
                    npm: AZURE_MODEL_NPM.to_string(),
                }),
            });
        }
    }

    (!models.is_empty()).then_some(models)
}

fn account_message(
    reason: SelectionReason,
    chosen: &AccountMatch,
    others: &[AccountMatch],
) -> String {
    let account = &chosen.account;
    let subscription = &chosen.subscription;
    let mut message = match reason {
        SelectionReason::AutoPicked => format!(
            "Auto-picked resource {} in subscription {} ({})",
            account.name, subscription.name, subscription.id
        ),
        SelectionReason::Specified => format!(
            "Using resource {} in subscription {} ({})",
            account.name, subscription.name, subscription.id
        ),
    };

    if !others.is_empty() {
        let other_names = others
            .iter()
            .take(5)
            .map(|m| format!("{} ({})", m.subscription.name, m.subscription.id))
            .collect::<Vec<_>>()
            .join(", ");
        message = format!(
            "{message}. Also found matches in: {other_names}. \
             Use --subscription-id to override."
        );
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{CognitiveAccount, Subscription};

    fn deployment(name: &str, model: Option<&str>) -> Deployment {
        Deployment {
            name: name.to_string(),
            model: model.map(str::to_string),
        }
    }

    fn account_match(name: &str, sub_name: &str, sub_id: &str) -> AccountMatch {
        AccountMatch {
            subscription: Subscription {
                id: sub_id.to_string(),
                name: sub_name.to_string(),
            },
            account: CognitiveAccount {
                name: name.to_string(),
                resource_group: "rg-1".to_string(),
                endpoint: format!("https://{name}.cognitiveservices.azure.com/"),
                location: "eastus2".to_string(),
                kind: "AIServices".to_string(),
            },
        }
    }

    #[test]
    fn available_models_lowercases_dedups_and_sorts() {
        let deployments = [
            deployment("GPT-4O", Some("gpt-4o")),
            deployment("kimi-k2", None),
            deployment("Bad Name!", Some("o3-mini")),
        ];
        let (sorted, set) = available_models(&deployments);
        assert_eq!(sorted, ["gpt-4o", "kimi-k2", "o3-mini"]);
        assert!(set.contains("gpt-4o"));
        assert!(!set.contains("bad name!"));
    }

    #[test]
    fn empty_whitelist_request_takes_everything_deployed() {
        let deployments = [deployment("gpt-4o", None), deployment("o3-mini", None)];
        let (sorted, set) = available_models(&deployments);
        let whitelist = resolve_whitelist(&[], &sorted, &set).unwrap();
        assert_eq!(whitelist, ["gpt-4o", "o3-mini"]);
    }

    #[test]
    fn unknown_whitelist_entries_are_a_validation_error_naming_them() {
        let deployments = [deployment("gpt-4o", None)];
        let (sorted, set) = available_models(&deployments);
        let err =
            resolve_whitelist(&["GPT-9".to_string()], &sorted, &set).unwrap_err();
        match &err {
            SetupError::Validation { field, detail } => {
                assert_eq!(field, "whitelist");
                assert!(detail.contains("gpt-9"));
                assert!(detail.contains("gpt-4o"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn whitelist_request_is_case_folded_and_deduped() {
        let deployments = [deployment("GPT-4O", Some("gpt-4o"))];
        let (sorted, set) = available_models(&deployments);
        let whitelist = resolve_whitelist(
            &["GPT-4O".to_string(), "gpt-4o".to_string()],
            &sorted,
            &set,
        )
        .unwrap();
        assert_eq!(whitelist, ["gpt-4o"]);
    }

    #[test]
    fn model_overrides_map_catalog_ids_onto_deployments() {
        let deployments = [deployment("GPT4O-PROD", Some("gpt-4o"))];
        let models = model_overrides(&deployments).unwrap();

        // Deployment entry keeps the exact deployment name for routing.
        let dep_entry = &models["gpt4o-prod"];
        assert_eq!(dep_entry.name, "gpt-4o (Azure)");
        assert_eq!(dep_entry.api.as_ref().unwrap().id, "GPT4O-PROD");

        // Catalog ID maps to the same deployment.
        let model_entry = &models["gpt-4o"];
        assert_eq!(model_entry.api.as_ref().unwrap().id, "GPT4O-PROD");
    }

    #[test]
    fn model_overrides_skip_unsafe_ids() {
        let deployments = [deployment("Bad Name!", None)];
        assert!(model_overrides(&deployments).is_none());
    }

    #[test]
    fn key_from_env_requires_a_non_empty_value() {
        let var = "AZURE_OPENCODE_SETUP_TEST_KEY_VAR";
        env::remove_var(var);
        assert!(matches!(
            key_from_env(var).unwrap_err(),
            SetupError::Validation { .. }
        ));

        env::set_var(var, "sk-test");
        assert_eq!(key_from_env(var).unwrap(), "sk-test");
        env::remove_var(var);
    }

    #[test]
    fn missing_key_env_name_is_a_validation_error() {
        assert!(matches!(
            key_from_env("").unwrap_err(),
            SetupError::Validation { .. }
        ));
    }

    #[test]
    fn account_message_mentions_other_matches() {
        let chosen = account_match("ai-foo", "Dev", "sub-1");
        let others = vec![account_match("ai-foo", "Prod", "sub-2")];

        let message = account_message(SelectionReason::Specified, &chosen, &others);
        assert!(message.starts_with("Using resource ai-foo in subscription Dev (sub-1)"));
        assert!(message.contains("Prod (sub-2)"));
        assert!(message.contains("--subscription-id"));

        let auto = account_message(SelectionReason::AutoPicked, &chosen, &[]);
        assert!(auto.starts_with("Auto-picked resource ai-foo"));
    }
}
