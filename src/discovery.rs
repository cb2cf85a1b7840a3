//! Azure resource discovery via the az CLI.
//!
//! Wraps az commands to discover Cognitive Services accounts, deployments,
//! and API keys. Every identifier flowing into the argument vector is
//! validated against a strict allow-list first, and the command always runs
//! as an argument vector, never through a shell. Raw az output can contain
//! secrets, so error messages carry fixed sanitized text only.

use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{Result, SetupError};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A subscription visible to the logged-in az user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub name: String,
}

/// A discovered Cognitive Services or OpenAI account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CognitiveAccount {
    pub name: String,
    #[serde(rename = "rg")]
    pub resource_group: String,
    pub endpoint: String,
    pub location: String,
    pub kind: String,
}

/// A deployed model within an account. `name` is the deployment name used
/// as the model ID in API calls; `model` is the underlying catalog name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Deployment {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// An account paired with the subscription it was found in.
#[derive(Debug, Clone)]
pub struct AccountMatch {
    pub subscription: Subscription,
    pub account: CognitiveAccount,
}

// Allow-list for identifiers interpolated into the argument vector.
// Intentionally restrictive: anything else is rejected, never sanitized.
fn azure_name_re() -> Regex {
    Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap()
}

fn validate_azure_name(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SetupError::Validation {
            field: field.to_string(),
            detail: "cannot be empty".to_string(),
        });
    }
    if !azure_name_re().is_match(value) {
        return Err(SetupError::Validation {
            field: field.to_string(),
            detail: "must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }
    Ok(())
}

fn discovery_error(detail: &str) -> SetupError {
    SetupError::Discovery {
        detail: detail.to_string(),
    }
}

/// Runner for az CLI commands.
#[derive(Debug, Clone)]
pub struct AzCli {
    program: String,
    timeout: Duration,
}

impl Default for AzCli {
    fn default() -> Self {
        AzCli::new("az", Duration::from_secs(60))
    }
}

impl AzCli {
    /// A runner invoking `program` with a per-command `timeout`.
    pub fn new(program: impl Into<String>, timeout: Duration) -> AzCli {
        AzCli {
            program: program.into(),
            timeout,
        }
    }

    /// Run one az command and return its stdout.
    ///
    /// Output is staged in unlinked temp files rather than pipes, so the
    /// child never blocks on a full pipe while we poll for exit. On timeout
    /// the child is killed.
    fn run(&self, args: &[&str]) -> Result<String> {
        let mut stdout_file = tempfile::tempfile().map_err(|err| SetupError::Io {
            path: "az stdout spool".to_string(),
            source: err,
        })?;
        let stderr_file = tempfile::tempfile().map_err(|err| SetupError::Io {
            path: "az stderr spool".to_string(),
            source: err,
        })?;
        let stdout_clone = stdout_file.try_clone().map_err(|err| SetupError::Io {
            path: "az stdout spool".to_string(),
            source: err,
        })?;

        tracing::debug!(program = %self.program, ?args, "running az command");
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_clone))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    discovery_error("az CLI not found. Please install Azure CLI.")
                } else {
                    discovery_error("Failed to launch az CLI.")
                }
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(discovery_error("az CLI command timed out."));
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(_) => return Err(discovery_error("Failed waiting for az CLI.")),
            }
        };

        if !status.success() {
            // stderr is deliberately discarded: it may contain secrets.
            return Err(discovery_error(
                "az CLI command failed. Run 'az login' and try again.",
            ));
        }

        let mut output = String::new();
        stdout_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| stdout_file.read_to_string(&mut output))
            .map_err(|_| discovery_error("Failed to read az CLI output."))?;
        Ok(output)
    }

    /// All subscriptions the current az login can see.
    pub fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let output = self.run(&[
            "account",
            "list",
            "--query",
            "[].{id:id, name:name}",
            "-o",
            "json",
        ])?;
        parse_subscriptions(&output)
    }

    /// Cognitive Services accounts (AIServices or OpenAI) in a subscription.
    pub fn list_cognitive_accounts(&self, subscription_id: &str) -> Result<Vec<CognitiveAccount>> {
        validate_azure_name(subscription_id, "subscription_id")?;
        let output = self.run(&[
            "cognitiveservices",
            "account",
            "list",
            "--subscription",
            subscription_id,
            "--query",
            "[?kind=='AIServices' || kind=='OpenAI'].\
             {name:name, kind:kind, endpoint:properties.endpoint, \
             rg:resourceGroup, location:location}",
            "-o",
            "json",
        ])?;
        parse_accounts(&output)
    }

    /// Model deployments for an account.
    pub fn list_deployments(
        &self,
        resource_group: &str,
        account_name: &str,
        subscription_id: &str,
    ) -> Result<Vec<Deployment>> {
        validate_azure_name(resource_group, "resource_group")?;
        validate_azure_name(account_name, "account_name")?;
        validate_azure_name(subscription_id, "subscription_id")?;
        let output = self.run(&[
            "cognitiveservices",
            "account",
            "deployment",
            "list",
            "-g",
            resource_group,
            "-n",
            account_name,
            "--subscription",
            subscription_id,
            "--query",
            "[].{name:name, model:properties.model.name}",
            "-o",
            "json",
        ])?;
        parse_deployments(&output)
    }

    /// Primary API key (`key1`) for an account.
    pub fn get_api_key(
        &self,
        resource_group: &str,
        account_name: &str,
        subscription_id: &str,
    ) -> Result<String> {
        validate_azure_name(resource_group, "resource_group")?;
        validate_azure_name(account_name, "account_name")?;
        validate_azure_name(subscription_id, "subscription_id")?;
        let output = self.run(&[
            "cognitiveservices",
            "account",
            "keys",
            "list",
            "-g",
            resource_group,
            "-n",
            account_name,
            "--subscription",
            subscription_id,
            "-o",
            "json",
        ])?;
        parse_primary_key(&output)
    }

    /// Find an account by name, searching one subscription or all of them.
    ///
    /// Returns the first match plus any further matches in other
    /// subscriptions, so the caller can tell the user about the ambiguity.
    pub fn find_cognitive_account(
        &self,
        resource_name: &str,
        subscription_id: Option<&str>,
    ) -> Result<(AccountMatch, Vec<AccountMatch>)> {
        validate_azure_name(resource_name, "resource_name")?;

        let mut matches = Vec::new();
        for subscription in self.scoped_subscriptions(subscription_id)? {
            for account in self.list_cognitive_accounts(&subscription.id)? {
                if account.name == resource_name {
                    matches.push(AccountMatch {
                        subscription: subscription.clone(),
                        account,
                    });
                }
            }
        }

        let mut iter = matches.into_iter();
        match iter.next() {
            Some(first) => Ok((first, iter.collect())),
            None => Err(discovery_error(
                "No matching Cognitive Services account found. Check the resource \
                 name and your az account access.",
            )),
        }
    }

    /// Auto-pick the account with the most deployments.
    ///
    /// Ties go to the account listed first. Returns the remaining
    /// candidates so the caller can mention them.
    pub fn pick_best_cognitive_account(
        &self,
        subscription_id: Option<&str>,
    ) -> Result<(AccountMatch, Vec<AccountMatch>)> {
        let mut candidates: Vec<(AccountMatch, usize)> = Vec::new();
        for subscription in self.scoped_subscriptions(subscription_id)? {
            for account in self.list_cognitive_accounts(&subscription.id)? {
                let deployments =
                    self.list_deployments(&account.resource_group, &account.name, &subscription.id)?;
                candidates.push((
                    AccountMatch {
                        subscription: subscription.clone(),
                        account,
                    },
                    deployments.len(),
                ));
            }
        }

        if candidates.is_empty() {
            return Err(discovery_error(
                "No Cognitive Services accounts found. Check your az account access.",
            ));
        }

        let mut best_index = 0;
        for (index, (_, count)) in candidates.iter().enumerate().skip(1) {
            if *count > candidates[best_index].1 {
                best_index = index;
            }
        }
        let (best, _) = candidates.remove(best_index);
        let others = candidates.into_iter().map(|(m, _)| m).collect();
        Ok((best, others))
    }

    fn scoped_subscriptions(&self, subscription_id: Option<&str>) -> Result<Vec<Subscription>> {
        match subscription_id {
            Some(id) => {
                validate_azure_name(id, "subscription_id")?;
                let named = self
                    .list_subscriptions()?
                    .into_iter()
                    .find(|subscription| subscription.id == id);
                Ok(vec![named.unwrap_or_else(|| Subscription {
                    id: id.to_string(),
                    name: id.to_string(),
                })])
            }
            None => self.list_subscriptions(),
        }
    }
}

fn parse_json_array(output: &str) -> Result<Vec<Value>> {
    let parsed: Value = serde_json::from_str(output)
        .map_err(|_| discovery_error("Failed to parse az CLI output as JSON."))?;
    match parsed {
        Value::Array(items) => Ok(items),
        _ => Err(discovery_error(
            "Unexpected response format: expected a list.",
        )),
    }
}

pub(crate) fn parse_subscriptions(output: &str) -> Result<Vec<Subscription>> {
    parse_json_array(output)?
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|_| discovery_error("Unexpected response format: expected a list."))
        })
        .collect()
}

pub(crate) fn parse_accounts(output: &str) -> Result<Vec<CognitiveAccount>> {
    parse_json_array(output)?
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|_| discovery_error("Unexpected response format: expected a list."))
        })
        .collect()
}

pub(crate) fn parse_deployments(output: &str) -> Result<Vec<Deployment>> {
    parse_json_array(output)?
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|_| discovery_error("Unexpected response format: expected a list."))
        })
        .collect()
}

pub(crate) fn parse_primary_key(output: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(output)
        .map_err(|_| discovery_error("Failed to parse az CLI output as JSON."))?;
    let Value::Object(keys) = parsed else {
        return Err(discovery_error(
            "Unexpected response format: expected an object.",
        ));
    };
    match keys.get("key1") {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(discovery_error("key1 not found in response.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_names_reject_injection_shapes() {
        for bad in ["", "a b", "x;rm -rf /", "$(cmd)", "a|b", "dot.dot", "a\nb"] {
            assert!(
                validate_azure_name(bad, "resource_group").is_err(),
                "accepted {bad:?}"
            );
        }
        for good in ["rg-1", "my_resource", "AbC123"] {
            validate_azure_name(good, "resource_group").unwrap();
        }
    }

    #[test]
    fn invalid_names_error_without_echoing_raw_input() {
        let err = validate_azure_name("$(rm -rf /)", "account_name").unwrap_err();
        assert!(!err.to_string().contains("rm -rf"));
    }

    #[test]
    fn parses_subscription_list() {
        let output = r#"[{"id": "sub-1", "name": "Dev"}, {"id": "sub-2", "name": "Prod"}]"#;
        let subs = parse_subscriptions(output).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].id, "sub-1");
        assert_eq!(subs[1].name, "Prod");
    }

    #[test]
    fn parses_account_list() {
        let output = r#"[{
            "name": "ai-foo",
            "kind": "AIServices",
            "endpoint": "https://ai-foo.cognitiveservices.azure.com/",
            "rg": "rg-1",
            "location": "eastus2"
        }]"#;
        let accounts = parse_accounts(output).unwrap();
        assert_eq!(accounts[0].resource_group, "rg-1");
        assert_eq!(accounts[0].kind, "AIServices");
    }

    #[test]
    fn parses_deployments_with_null_model() {
        let output = r#"[{"name": "GPT-4O", "model": "gpt-4o"}, {"name": "custom", "model": null}]"#;
        let deployments = parse_deployments(output).unwrap();
        assert_eq!(deployments[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(deployments[1].model, None);
    }

    #[test]
    fn rejects_non_list_payloads() {
        let err = parse_deployments(r#"{"name": "x"}"#).unwrap_err();
        assert!(err.to_string().contains("expected a list"));

        let err = parse_accounts("not json").unwrap_err();
        assert!(err.to_string().contains("as JSON"));
    }

    #[test]
    fn primary_key_requires_key1() {
        assert_eq!(
            parse_primary_key(r#"{"key1": "sk-1", "key2": "sk-2"}"#).unwrap(),
            "sk-1"
        );

        let err = parse_primary_key(r#"{"key2": "sk-2"}"#).unwrap_err();
        assert!(err.to_string().contains("key1 not found"));

        let err = parse_primary_key(r#"["sk-1"]"#).unwrap_err();
        assert!(err.to_string().contains("expected an object"));
    }

    #[test]
    fn missing_program_is_a_sanitized_discovery_error() {
        let az = AzCli::new("definitely-not-a-real-binary-xyz", Duration::from_secs(1));
        let err = az.list_subscriptions().unwrap_err();
        match &err {
            SetupError::Discovery { detail } => assert!(detail.contains("not found")),
            other => panic!("expected Discovery, got {other:?}"),
        }
    }
}
