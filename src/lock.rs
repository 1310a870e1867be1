//! Host-wide singleton guard for the coordinator.
//!
//! The lock is a file holding the owner's pid, created with `O_EXCL`
//! semantics so two coordinators racing to start cannot both win. The guard
//! removes the file on drop, which covers normal completion, early `?`
//! returns, and unwinding panics. A coordinator killed with `SIGKILL` leaves a
//! stale file behind; the contention error tells the operator how to remove it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::CoordinatorError;

/// Held for the whole coordinator lifetime; released on drop.
#[derive(Debug)]
pub struct CoordinatorLock {
    path: PathBuf,
    released: bool,
}

impl CoordinatorLock {
    /// Create the lock file containing this process's pid.
    ///
    /// # Errors
    /// [`CoordinatorError::LockContention`] if the file already exists, with
    /// the pid it records. Other I/O failures map to [`CoordinatorError::Io`].
    pub fn acquire(path: &Path) -> Result<Self, CoordinatorError> {
        Self::acquire_with_pid(path, std::process::id())
    }

    fn acquire_with_pid(path: &Path, pid: u32) -> Result<Self, CoordinatorError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CoordinatorError::LockContention {
                    pid: read_owner(path),
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let lock = Self {
            path: path.to_path_buf(),
            released: false,
        };
        // `lock` now owns the file, so a failed write still removes it.
        writeln!(file, "{pid}")?;
        file.sync_all()?;
        debug!(path = %path.display(), pid, "coordinator lock acquired");
        Ok(lock)
    }

    /// Lock file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file. Calling it again, or after someone else removed
    /// the file, is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "coordinator lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

impl Drop for CoordinatorLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pid recorded in an existing lock file, for diagnostics only.
///
/// Returns `"unknown"` when the file is unreadable or empty.
#[must_use]
pub fn read_owner(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}
