//! Canonical file paths for the OpenCode config and auth stores.
//!
//! Contract from the OpenCode docs:
//!   - Config: `~/.config/opencode/opencode.json`
//!   - Auth:   `~/.local/share/opencode/auth.json`
//!
//! Both are home-relative on every platform; no `%APPDATA%` or
//! platform-dirs indirection.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SetupError};

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| SetupError::Io {
        path: "~".to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "home directory not found"),
    })
}

/// Absolute path to `opencode.json`.
pub fn opencode_config_path() -> Result<PathBuf> {
    Ok(home_dir()?
        .join(".config")
        .join("opencode")
        .join("opencode.json"))
}

/// Absolute path to `auth.json`.
pub fn opencode_auth_path() -> Result<PathBuf> {
    Ok(home_dir()?
        .join(".local")
        .join("share")
        .join("opencode")
        .join("auth.json"))
}

/// Create the parent directory chain for `target`.
///
/// With `secure` on POSIX, the immediate parent is tightened to 0o700.
/// On Windows restriction happens at the file level instead.
pub fn ensure_parent_dir(target: &Path, secure: bool) -> Result<()> {
    let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|err| SetupError::Io {
        path: parent.display().to_string(),
        source: err,
    })?;

    #[cfg(unix)]
    if secure {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|err| {
            SetupError::Io {
                path: parent.display().to_string(),
                source: err,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = secure;

    Ok(())
}
