//! Run-level error type for the coordinator.
//!
//! [`CoordinatorError`] covers the conditions that abort a whole run. Per-file
//! failures (unreadable raw file, non-zero merge tool exit) never surface here:
//! they are contained inside the worker that hit them and reported through
//! [`MergeReply`](crate::worker::MergeReply) instead.
//!
//! Messages follow the same shape everywhere: what went wrong, then a
//! `To fix:` hint when there is something the operator can do.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::merge_tool::MergeToolError;
use crate::queue::QueueError;

/// Exit code when another coordinator holds the lock.
pub const EXIT_LOCK_HELD: i32 = 3;
/// Exit code when the pool drained without producing any accumulator.
pub const EXIT_NO_DATA: i32 = 4;
/// Exit code when the final aggregation merge failed.
pub const EXIT_FINAL_MERGE_FAILED: i32 = 5;

/// Errors that abort a coordinator run.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Another coordinator already holds the singleton lock.
    ///
    /// Raised before any queue, socket, or worker is set up.
    #[error(
        "another coordinator is already running (pid {pid}, lock file {}).\n  \
         To fix: stop it with `profmerge stop`; if no coordinator is running, remove the stale lock:\n    \
         rm {}",
        path.display(),
        path.display()
    )]
    LockContention {
        /// Process identity recorded in the existing lock file (diagnostic only).
        pid: String,
        /// Location of the lock file.
        path: PathBuf,
    },

    /// The pool drained and not a single worker produced an accumulator.
    #[error(
        "no profiling data collected: none of the {workers} worker(s) produced an accumulator.\n  \
         To fix: make sure test processes send raw file paths to the control address before shutdown."
    )]
    NoDataCollected {
        /// Pool size at drain time.
        workers: usize,
    },

    /// The merge across all accumulators into the final artifact failed.
    #[error("final merge into {} failed: {source}", output.display())]
    FinalMergeFailed {
        /// The configured final artifact path.
        output: PathBuf,
        /// What the merge tool reported.
        #[source]
        source: MergeToolError,
    },

    /// The control listener could not bind its address.
    #[error(
        "could not bind control listener on {address}: {source}\n  \
         To fix: pick a free address with `[control] address` in profmerge.toml."
    )]
    Bind {
        /// The configured control address.
        address: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The accept loop failed in a way it cannot recover from.
    #[error("control listener failed: {0}")]
    Listener(#[source] io::Error),

    /// A merge worker could not be launched at pool start.
    #[error("failed to launch merge worker {ordinal}: {source}")]
    WorkerLaunch {
        /// Ordinal of the worker that failed to start.
        ordinal: usize,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// The scratch directory could not be prepared.
    #[error("scratch directory {} unusable: {source}", path.display())]
    Scratch {
        /// Scratch directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The work queue was disconnected.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Any other I/O failure in the coordinator itself.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoordinatorError {
    /// Process exit code for this error.
    ///
    /// The three conditions an orchestrating script may want to branch on get
    /// their own code; everything else is `1`.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::LockContention { .. } => EXIT_LOCK_HELD,
            Self::NoDataCollected { .. } => EXIT_NO_DATA,
            Self::FinalMergeFailed { .. } => EXIT_FINAL_MERGE_FAILED,
            _ => 1,
        }
    }
}
