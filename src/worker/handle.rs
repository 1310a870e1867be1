//! How a pool slot talks to its worker.
//!
//! [`WorkerLauncher`] creates workers by ordinal; [`WorkerHandle`] submits one
//! raw file at a time and stops the worker. Two hostings exist: a child
//! process per worker ([`ProcessLauncher`]) and an in-thread session
//! ([`InlineLauncher`]).

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::MergeConfig;
use crate::merge_tool::MergeTool;
use crate::queue::RawFileRef;
use crate::telemetry;

use super::accumulator::{Accumulator, accumulator_path};
use super::session::{MergeSession, SessionSettings};
use super::{MergeReply, MergeRequest};

/// The worker died or stopped answering mid-item.
#[derive(Debug, Error)]
#[error("worker {ordinal} lost: {reason}")]
pub struct WorkerLost {
    /// Ordinal of the lost worker.
    pub ordinal: usize,
    /// What was observed.
    pub reason: String,
}

/// Coordinator-side handle to one live worker.
pub trait WorkerHandle: Send {
    /// Merge one raw file and wait for the outcome.
    ///
    /// # Errors
    /// [`WorkerLost`] if the worker cannot be reached or died; the item is
    /// then lost.
    fn submit(&mut self, raw: &RawFileRef) -> Result<MergeReply, WorkerLost>;

    /// Stop the worker and wait for it to exit.
    ///
    /// # Errors
    /// [`WorkerLost`] if the worker exited abnormally.
    fn shutdown(self: Box<Self>) -> Result<(), WorkerLost>;
}

/// Creates workers for pool slots.
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker for `ordinal`, reusing its accumulator if present.
    ///
    /// # Errors
    /// Returns the spawn error.
    fn launch(&self, ordinal: usize) -> io::Result<Box<dyn WorkerHandle>>;

    /// Accumulator path the worker for `ordinal` writes.
    fn accumulator_path(&self, ordinal: usize) -> PathBuf;
}

// ---------------------------------------------------------------------------
// Inline
// ---------------------------------------------------------------------------

/// Runs each worker's session inside its slot thread.
pub struct InlineLauncher {
    scratch: PathBuf,
    tool: Arc<dyn MergeTool>,
    settings: SessionSettings,
}

impl InlineLauncher {
    /// Launcher writing accumulators under `scratch`.
    #[must_use]
    pub fn new(scratch: PathBuf, tool: Arc<dyn MergeTool>, settings: SessionSettings) -> Self {
        Self {
            scratch,
            tool,
            settings,
        }
    }
}

impl WorkerLauncher for InlineLauncher {
    fn launch(&self, ordinal: usize) -> io::Result<Box<dyn WorkerHandle>> {
        let accumulator = Accumulator::new(ordinal, self.accumulator_path(ordinal));
        Ok(Box::new(InlineWorker(MergeSession::new(
            accumulator,
            Arc::clone(&self.tool),
            self.settings,
        ))))
    }

    fn accumulator_path(&self, ordinal: usize) -> PathBuf {
        accumulator_path(&self.scratch, ordinal)
    }
}

struct InlineWorker(MergeSession);

impl WorkerHandle for InlineWorker {
    fn submit(&mut self, raw: &RawFileRef) -> Result<MergeReply, WorkerLost> {
        Ok(self.0.handle(raw))
    }

    fn shutdown(self: Box<Self>) -> Result<(), WorkerLost> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Spawns `<program> worker ...` per ordinal.
///
/// `program` is normally the running `profmerge` executable. Children get
/// their own process group, so a terminal Ctrl-C reaches only the coordinator
/// and the workers are stopped through the drain instead.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    scratch: PathBuf,
    merge: MergeConfig,
}

impl ProcessLauncher {
    /// Launcher running `program` with the `[merge]` settings.
    #[must_use]
    pub const fn new(program: PathBuf, scratch: PathBuf, merge: MergeConfig) -> Self {
        Self {
            program,
            scratch,
            merge,
        }
    }

    fn command(&self, ordinal: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--ordinal")
            .arg(ordinal.to_string())
            .arg("--accumulator")
            .arg(self.accumulator_path(ordinal))
            .arg("--tool")
            .arg(&self.merge.tool);
        for arg in &self.merge.args {
            cmd.arg(format!("--tool-arg={arg}"));
        }
        cmd.arg("--on-failure").arg(self.merge.on_failure.to_string());
        if !self.merge.remove_raw_files {
            cmd.arg("--keep-raw");
        }
        if let Some(traceparent) = telemetry::current_traceparent() {
            cmd.env("TRACEPARENT", traceparent);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, ordinal: usize) -> io::Result<Box<dyn WorkerHandle>> {
        let mut child = self.command(ordinal).spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("worker pipes were not created"));
        };
        debug!(worker = ordinal, pid = child.id(), "worker process started");
        Ok(Box::new(ProcessWorker {
            ordinal,
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            reaped: false,
        }))
    }

    fn accumulator_path(&self, ordinal: usize) -> PathBuf {
        accumulator_path(&self.scratch, ordinal)
    }
}

struct ProcessWorker {
    ordinal: usize,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    reaped: bool,
}

impl ProcessWorker {
    fn lost(&mut self, what: &str) -> WorkerLost {
        let status = self.reap();
        WorkerLost {
            ordinal: self.ordinal,
            reason: format!("{what} ({status})"),
        }
    }

    /// Close stdin and wait for exit; describes how the child ended.
    fn reap(&mut self) -> String {
        drop(self.stdin.take());
        if self.reaped {
            return "already reaped".to_owned();
        }
        self.reaped = true;
        match self.child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        }
    }

    fn write_request(&mut self, raw: &RawFileRef) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let request = MergeRequest::Merge { raw: raw.clone() };
        serde_json::to_writer(&mut *stdin, &request)?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }
}

impl WorkerHandle for ProcessWorker {
    fn submit(&mut self, raw: &RawFileRef) -> Result<MergeReply, WorkerLost> {
        if let Err(e) = self.write_request(raw) {
            return Err(self.lost(&format!("request write failed: {e}")));
        }
        let mut line = String::new();
        match self.stdout.read_line(&mut line) {
            Ok(0) => Err(self.lost("exited before replying")),
            Ok(_) => match serde_json::from_str(&line) {
                Ok(reply) => Ok(reply),
                Err(e) => Err(self.lost(&format!("unparseable reply {:?}: {e}", line.trim()))),
            },
            Err(e) => Err(self.lost(&format!("reply read failed: {e}"))),
        }
    }

    fn shutdown(mut self: Box<Self>) -> Result<(), WorkerLost> {
        drop(self.stdin.take());
        self.reaped = true;
        match self.child.wait() {
            Ok(status) if status.success() => {
                debug!(worker = self.ordinal, "worker process exited");
                Ok(())
            }
            Ok(status) => Err(WorkerLost {
                ordinal: self.ordinal,
                reason: format!("exited with {status}"),
            }),
            Err(e) => Err(WorkerLost {
                ordinal: self.ordinal,
                reason: format!("wait failed: {e}"),
            }),
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
