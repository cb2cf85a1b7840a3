//! azure-opencode-setup CLI
//!
//! Entry point for the `azure-opencode-setup` command-line tool.
//!
//! Security invariants:
//!   - No API key via a `--key` argument (process-list leakage).
//!   - Key only from an env var, a no-echo prompt, or az itself.
//!
//! Exit codes:
//!   - 0: success
//!   - 2: usage error (clap default)
//!   - 3: validation / security error
//!   - 4: filesystem / lock / permission / discovery error

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use azure_opencode_setup::locking::DEFAULT_LOCK_TIMEOUT;
use azure_opencode_setup::setup::{run_setup, KeySource, SetupParams};
use azure_opencode_setup::EXIT_OK;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "azure-opencode-setup")]
#[command(about = "Configure the OpenCode CLI to talk to Azure AI Services", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write auth + config for an Azure provider
    Setup {
        /// Azure Cognitive Services resource name. If omitted, auto-picks
        /// the account with the most deployments.
        #[arg(long)]
        resource_name: Option<String>,

        /// Subscription ID to scope discovery.
        #[arg(long)]
        subscription_id: Option<String>,

        /// az CLI timeout in seconds per command.
        #[arg(long, default_value_t = 60)]
        az_timeout_seconds: u64,

        /// Override path to opencode.json.
        #[arg(long)]
        config_path: Option<PathBuf>,

        /// Override path to auth.json.
        #[arg(long)]
        auth_path: Option<PathBuf>,

        /// OpenCode provider ID.
        #[arg(long, default_value = "azure-cognitive-services")]
        provider_id: String,

        /// Model names to whitelist (default: everything deployed).
        #[arg(long, num_args = 0..)]
        whitelist: Vec<String>,

        /// Provider IDs to disable (default: azure unless --provider-id is
        /// azure).
        #[arg(long, num_args = 0..)]
        disabled_providers: Option<Vec<String>>,

        /// Environment variable name for the API key.
        #[arg(long, default_value = "AZURE_OPENAI_API_KEY")]
        key_env: String,

        /// Read the API key from stdin (no echo) instead of env.
        #[arg(long, conflicts_with = "key_azure")]
        key_stdin: bool,

        /// Fetch the API key for the discovered account via az.
        #[arg(long)]
        key_azure: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Setup {
            resource_name,
            subscription_id,
            az_timeout_seconds,
            config_path,
            auth_path,
            provider_id,
            whitelist,
            disabled_providers,
            key_env,
            key_stdin,
            key_azure,
        } => {
            // Don't disable the azure provider when it is the one being
            // configured.
            let disabled_providers = disabled_providers.unwrap_or_else(|| {
                if provider_id == "azure" {
                    Vec::new()
                } else {
                    vec!["azure".to_string()]
                }
            });
            let key_source = if key_stdin {
                KeySource::Stdin
            } else if key_azure {
                KeySource::Azure
            } else {
                KeySource::Env(key_env)
            };

            let params = SetupParams {
                resource_name,
                provider_id,
                whitelist,
                disabled_providers,
                subscription_id,
                az_program: "az".to_string(),
                az_timeout: Duration::from_secs(az_timeout_seconds),
                key_source,
                config_path,
                auth_path,
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
            };
            run(&params)
        }
    };
    process::exit(code);
}

fn run(params: &SetupParams) -> i32 {
    match run_setup(params) {
        Ok(outcome) => {
            println!("{}", outcome.account_message);
            println!(
                "Configured {} for {}",
                outcome.provider_id, outcome.resource_name
            );
            println!("  Config: {}", outcome.config_path.display());
            println!("  Auth:   {}", outcome.auth_path.display());
            EXIT_OK
        }
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}
