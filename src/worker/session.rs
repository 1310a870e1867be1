//! One worker's merge loop, independent of how the worker is hosted.

use std::fs;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{MergeConfig, OnMergeFailure};
use crate::merge_tool::MergeTool;
use crate::queue::RawFileRef;

use super::{Accumulator, MergeReply, MergeRequest};

/// Per-file behavior shared by every worker of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// Delete raw files after a successful merge.
    pub remove_raw: bool,
    /// What to do after a per-file failure.
    pub on_failure: OnMergeFailure,
}

impl SessionSettings {
    /// Settings from the `[merge]` table.
    #[must_use]
    pub const fn from_config(config: &MergeConfig) -> Self {
        Self {
            remove_raw: config.remove_raw_files,
            on_failure: config.on_failure,
        }
    }
}

/// Folds raw files into one accumulator.
pub struct MergeSession {
    accumulator: Accumulator,
    tool: Arc<dyn MergeTool>,
    settings: SessionSettings,
}

impl MergeSession {
    /// Session writing into `accumulator` through `tool`.
    #[must_use]
    pub fn new(accumulator: Accumulator, tool: Arc<dyn MergeTool>, settings: SessionSettings) -> Self {
        Self {
            accumulator,
            tool,
            settings,
        }
    }

    /// The accumulator this session writes.
    #[must_use]
    pub const fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Merge one raw file and report the outcome.
    ///
    /// Never fails: per-file problems become [`MergeReply::Skipped`] or,
    /// under [`OnMergeFailure::AbortWorker`], [`MergeReply::Aborted`].
    pub fn handle(&mut self, raw: &RawFileRef) -> MergeReply {
        let worker = self.accumulator.ordinal();
        match self.accumulator.absorb(raw.path(), self.tool.as_ref()) {
            Ok(()) => {
                debug!(worker, file = %raw, stage = "merge", "merged raw file");
                if self.settings.remove_raw
                    && let Err(e) = fs::remove_file(raw.path())
                {
                    warn!(worker, file = %raw, stage = "cleanup", error = %e, "merged but could not remove raw file");
                }
                MergeReply::Merged
            }
            Err(failure) => {
                warn!(
                    worker,
                    file = %raw,
                    stage = %failure.stage,
                    reason = %failure.reason,
                    policy = %self.settings.on_failure,
                    "skipping raw file"
                );
                match self.settings.on_failure {
                    OnMergeFailure::Skip => MergeReply::Skipped {
                        stage: failure.stage,
                        reason: failure.reason,
                    },
                    OnMergeFailure::AbortWorker => MergeReply::Aborted {
                        stage: failure.stage,
                        reason: failure.reason,
                    },
                }
            }
        }
    }
}

/// Serve merge requests read line by line from `reader` until EOF.
///
/// Used by the worker process with its stdin and stdout. Returns after EOF
/// or after answering with [`MergeReply::Aborted`].
///
/// # Errors
/// Returns an I/O error if reading a request or writing a reply fails.
pub fn serve(reader: impl BufRead, mut writer: impl Write, session: &mut MergeSession) -> io::Result<()> {
    let worker = session.accumulator().ordinal();
    info!(worker, accumulator = %session.accumulator().path().display(), "merge worker ready");

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<MergeRequest>(&line) {
            Ok(MergeRequest::Merge { raw }) => session.handle(&raw),
            Err(e) => {
                warn!(worker, stage = "ingest", error = %e, "unparseable merge request");
                MergeReply::Skipped {
                    stage: super::FailureStage::Ingest,
                    reason: format!("unparseable request: {e}"),
                }
            }
        };
        serde_json::to_writer(&mut writer, &reply)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        if matches!(reply, MergeReply::Aborted { .. }) {
            info!(worker, "merge worker aborting after failure");
            return Ok(());
        }
    }

    info!(worker, "merge worker input closed, exiting");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::worker::FailureStage;
    use crate::worker::accumulator::accumulator_path;
    use crate::worker::accumulator::tests::LineUnionTool;
    use std::io::Cursor;
    use std::path::Path;

    fn session(dir: &Path, settings: SessionSettings) -> MergeSession {
        MergeSession::new(
            Accumulator::new(0, accumulator_path(dir, 0)),
            Arc::new(LineUnionTool),
            settings,
        )
    }

    const SKIP: SessionSettings = SessionSettings {
        remove_raw: true,
        on_failure: OnMergeFailure::Skip,
    };

    #[test]
    fn successful_merge_removes_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("a.profraw");
        fs::write(&raw, "A\n").unwrap();

        let mut s = session(dir.path(), SKIP);
        assert_eq!(s.handle(&RawFileRef::new(&raw)), MergeReply::Merged);
        assert!(!raw.exists());
    }

    #[test]
    fn keep_raw_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("a.profraw");
        fs::write(&raw, "A\n").unwrap();

        let mut s = session(
            dir.path(),
            SessionSettings {
                remove_raw: false,
                ..SKIP
            },
        );
        assert_eq!(s.handle(&RawFileRef::new(&raw)), MergeReply::Merged);
        assert!(raw.exists());
    }

    #[test]
    fn failed_file_is_skipped_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("bad.profraw");
        fs::write(&raw, "CORRUPT\n").unwrap();

        let mut s = session(dir.path(), SKIP);
        let reply = s.handle(&RawFileRef::new(&raw));
        assert!(matches!(
            reply,
            MergeReply::Skipped {
                stage: FailureStage::MergeTool,
                ..
            }
        ));
        assert!(raw.exists());
    }

    #[test]
    fn abort_policy_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(
            dir.path(),
            SessionSettings {
                remove_raw: true,
                on_failure: OnMergeFailure::AbortWorker,
            },
        );
        let reply = s.handle(&RawFileRef::new(dir.path().join("missing.profraw")));
        assert!(matches!(
            reply,
            MergeReply::Aborted {
                stage: FailureStage::Ingest,
                ..
            }
        ));
    }

    #[test]
    fn serve_answers_each_line_and_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.profraw");
        fs::write(&a, "A\n").unwrap();
        let missing = dir.path().join("missing.profraw");

        let input = format!(
            "{}\n\n{}\nnot json\n",
            serde_json::to_string(&MergeRequest::Merge { raw: RawFileRef::new(&a) }).unwrap(),
            serde_json::to_string(&MergeRequest::Merge { raw: RawFileRef::new(&missing) }).unwrap(),
        );
        let mut out = Vec::new();
        let mut s = session(dir.path(), SKIP);
        serve(Cursor::new(input), &mut out, &mut s).unwrap();

        let replies: Vec<MergeReply> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], MergeReply::Merged);
        assert!(matches!(replies[1], MergeReply::Skipped { stage: FailureStage::Ingest, .. }));
        assert!(matches!(replies[2], MergeReply::Skipped { stage: FailureStage::Ingest, .. }));
        assert_eq!(fs::read_to_string(s.accumulator().path()).unwrap(), "A\n");
    }

    #[test]
    fn serve_returns_after_abort() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.profraw");
        let b = dir.path().join("b.profraw");
        fs::write(&b, "B\n").unwrap();

        let input = format!(
            "{}\n{}\n",
            serde_json::to_string(&MergeRequest::Merge { raw: RawFileRef::new(&missing) }).unwrap(),
            serde_json::to_string(&MergeRequest::Merge { raw: RawFileRef::new(&b) }).unwrap(),
        );
        let mut out = Vec::new();
        let mut s = session(
            dir.path(),
            SessionSettings {
                remove_raw: true,
                on_failure: OnMergeFailure::AbortWorker,
            },
        );
        serve(Cursor::new(input), &mut out, &mut s).unwrap();

        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
        assert!(b.exists());
        assert!(!s.accumulator().exists());
    }
}
