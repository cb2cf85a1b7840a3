//! Azure OpenCode Setup - configure OpenCode against Azure AI Services
//!
//! This crate discovers Azure AI-service deployments through the az CLI and
//! merges the discovered facts into OpenCode's config and auth files, using
//! cross-process file locks, atomic write-replace, and backups so the shared
//! JSON state on disk is never corrupted.

pub mod discovery;
pub mod errors;
pub mod io;
pub mod locking;
pub mod merge;
pub mod paths;
pub mod setup;

pub use errors::{Result, SetupError, EXIT_FILESYSTEM, EXIT_OK, EXIT_VALIDATION};
pub use io::{atomic_write_json, read_json_object, restrict_permissions, JsonObject};
pub use locking::{backup_file, FileLock, DEFAULT_LOCK_TIMEOUT};
pub use merge::{merge_auth, merge_config, validate_resource_name, ProviderMergeSpec};
pub use setup::{run_setup, KeySource, SetupOutcome, SetupParams};
