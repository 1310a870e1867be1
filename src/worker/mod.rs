//! Merge workers and the pool that feeds them.
//!
//! A worker owns one accumulator file and folds raw files into it one at a
//! time. The pool runs one slot thread per worker ordinal. A slot takes an
//! item from the shared [`IngestQueue`](crate::queue::IngestQueue) only when
//! its worker is idle, hands it over, and records the reply.
//!
//! Workers are child processes by default ([`ProcessLauncher`]), talking
//! JSON lines over stdin/stdout:
//!
//! ```text
//! coordinator → worker   {"op":"merge","raw":"/tmp/a.profraw"}
//! worker → coordinator   {"status":"merged"}
//!                        {"status":"skipped","stage":"merge_tool","reason":"..."}
//!                        {"status":"aborted","stage":"ingest","reason":"..."}
//! ```
//!
//! Closing the worker's stdin stops it. [`InlineLauncher`] runs the same
//! [`MergeSession`] inside the slot thread instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::queue::RawFileRef;

pub mod accumulator;
pub mod handle;
pub mod pool;
pub mod session;

pub use accumulator::{Accumulator, FileFailure, accumulator_path, is_accumulator_file};
pub use handle::{InlineLauncher, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerLost};
pub use pool::{WorkerPool, WorkerReport};
pub use session::{MergeSession, SessionSettings, serve};

/// A request sent to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MergeRequest {
    /// Fold `raw` into the accumulator.
    Merge {
        /// Raw file to merge.
        raw: RawFileRef,
    },
}

/// Where a per-file failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// The raw file could not be opened or is not a regular file.
    Ingest,
    /// The merge tool failed on it.
    MergeTool,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::MergeTool => write!(f, "merge_tool"),
        }
    }
}

/// A worker's answer to one [`MergeRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeReply {
    /// The raw file is now part of the accumulator.
    Merged,
    /// The file was dropped; the worker keeps going.
    Skipped {
        /// Failing stage.
        stage: FailureStage,
        /// Human-readable cause.
        reason: String,
    },
    /// The file was dropped and the worker is stopping.
    Aborted {
        /// Failing stage.
        stage: FailureStage,
        /// Human-readable cause.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = MergeRequest::Merge {
            raw: RawFileRef::new("/tmp/a.profraw"),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"op":"merge","raw":"/tmp/a.profraw"}"#
        );
    }

    #[test]
    fn reply_wire_shape() {
        assert_eq!(
            serde_json::to_string(&MergeReply::Merged).unwrap(),
            r#"{"status":"merged"}"#
        );
        let skipped = MergeReply::Skipped {
            stage: FailureStage::MergeTool,
            reason: "exit 1".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&skipped).unwrap(),
            r#"{"status":"skipped","stage":"merge_tool","reason":"exit 1"}"#
        );
        let parsed: MergeReply =
            serde_json::from_str(r#"{"status":"aborted","stage":"ingest","reason":"gone"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            MergeReply::Aborted {
                stage: FailureStage::Ingest,
                reason: "gone".to_owned()
            }
        );
    }
}
