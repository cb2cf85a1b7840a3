//! Cross-process file locking and backup utilities.
//!
//! Invariants:
//!   - Locks are advisory, held on a sidecar `<file>.lock` so acquisition
//!     never blocks a concurrent reader of the data file itself.
//!   - Locks release on every exit path via the guard's Drop.
//!   - Backup names combine a microsecond UTC timestamp with a random
//!     suffix, unique even under rapid successive calls.
//!   - Backups carry owner-only permissions from the moment they exist
//!     wherever the platform allows create-with-mode.

use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs4::fs_std::FileExt;
use rand::RngCore;

use crate::errors::{Result, SetupError};

/// Default time to wait for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sidecar lock path for a data file: `auth.json` → `auth.json.lock`.
///
/// The suffix is appended to the full file name rather than replacing the
/// extension, so two data files differing only in extension never collide
/// on one lock file.
fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Exclusive advisory lock over a data file, held until drop.
///
/// Mutual exclusion holds among cooperating processes that take the same
/// lock; a process writing to the data file without it is not stopped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    data_path: PathBuf,
}

impl FileLock {
    /// Acquire the lock for `path`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`SetupError::Lock`] when the lock cannot be acquired in time, with
    /// the elapsed wait in the detail.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<FileLock> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| SetupError::Io {
                    path: parent.display().to_string(),
                    source: err,
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| SetupError::Lock {
                path: path.display().to_string(),
                detail: format!("failed to open {}: {err}", lock_path.display()),
            })?;

        let start = Instant::now();
        loop {
            if matches!(FileExt::try_lock_exclusive(&file), Ok(true)) {
                return Ok(FileLock {
                    file,
                    data_path: path.to_path_buf(),
                });
            }
            if start.elapsed() >= timeout {
                return Err(SetupError::Lock {
                    path: path.display().to_string(),
                    detail: format!(
                        "exclusive lock not acquired within {:.1}s",
                        start.elapsed().as_secs_f64()
                    ),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // A release failure must never mask the critical section's outcome.
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(
                path = %self.data_path.display(),
                error = %err,
                "failed to release lock"
            );
        }
    }
}

/// Create a uniquely-named backup of `path` in the same directory.
///
/// The name is `<file>.<UTC timestamp, microseconds>_<4 hex>.bak`; the
/// random suffix keeps names unique even on clocks without microsecond
/// resolution. Content is copied byte-for-byte and mtime/atime carried over
/// from the source.
///
/// Assumes the caller has vetted `path` against symlinks pointing outside
/// the intended directory.
///
/// # Errors
///
/// [`SetupError::Io`] if the source cannot be read or the backup cannot be
/// created.
pub fn backup_file(path: &Path) -> Result<PathBuf> {
    let ts = Utc::now().format("%Y%m%dT%H%M%S%.6f");
    let mut rand_bytes = [0u8; 2];
    rand::thread_rng().fill_bytes(&mut rand_bytes);

    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{ts}_{}.bak", hex::encode(rand_bytes)));
    let backup_path = path.with_file_name(name);

    let content = fs::read(path).map_err(|err| SetupError::Io {
        path: path.display().to_string(),
        source: err,
    })?;
    let backup_err = |err: std::io::Error| SetupError::Io {
        path: backup_path.display().to_string(),
        source: err,
    };

    let mut file = open_backup(&backup_path).map_err(backup_err)?;
    file.write_all(&content).map_err(backup_err)?;

    let meta = fs::metadata(path).map_err(|err| SetupError::Io {
        path: path.display().to_string(),
        source: err,
    })?;
    let mut times = FileTimes::new();
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    file.set_times(times).map_err(backup_err)?;
    drop(file);

    // Without create-with-mode the restriction races file creation; the
    // window is accepted as residual risk on these platforms.
    #[cfg(not(unix))]
    crate::io::restrict_permissions(&backup_path, false)?;

    Ok(backup_path)
}

#[cfg(unix)]
fn open_backup(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_backup(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}
