//! Error taxonomy for azure-opencode-setup.
//!
//! Every error that can reach the CLI maps to a stable exit-code family, so
//! scripts invoking this tool can branch on outcome without string-matching
//! messages.

use std::io;

/// Successful completion.
pub const EXIT_OK: i32 = 0;

/// Validation or schema failure (bad input, malformed config shape).
/// Usage errors exit with 2, produced by clap itself.
pub const EXIT_VALIDATION: i32 = 3;

/// Filesystem, lock, permission, or external-tool failure.
pub const EXIT_FILESYSTEM: i32 = 4;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SetupError>;

/// Errors raised by the setup core and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// A file exists but does not contain syntactically valid JSON.
    #[error("Invalid JSON in {path}: {detail}")]
    InvalidJson { path: String, detail: String },

    /// JSON parsed but has the wrong shape (e.g. array instead of object).
    #[error("Invalid schema in {path}: {detail}")]
    InvalidSchema { path: String, detail: String },

    /// Caller-supplied input failed a named constraint.
    #[error("Validation error on '{field}': {detail}")]
    Validation { field: String, detail: String },

    /// An exclusive file lock could not be acquired before the timeout.
    #[error("Lock error on {path}: {detail}")]
    Lock { path: String, detail: String },

    /// Permission restriction failed in strict mode. The data write that
    /// preceded it has already completed.
    #[error("Permission error on {path}: {source}")]
    Permission {
        path: String,
        #[source]
        source: io::Error,
    },

    /// An az CLI lookup failed. The detail is always a fixed, sanitized
    /// message; raw command output can contain secrets and never lands here.
    #[error("Discovery error: {detail}")]
    Discovery { detail: String },

    /// A filesystem operation failed outside the cases above.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl SetupError {
    /// Exit-code family for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupError::Validation { .. } | SetupError::InvalidSchema { .. } => EXIT_VALIDATION,
            SetupError::InvalidJson { .. }
            | SetupError::Lock { .. }
            | SetupError::Permission { .. }
            | SetupError::Discovery { .. }
            | SetupError::Io { .. } => EXIT_FILESYSTEM,
        }
    }
}
