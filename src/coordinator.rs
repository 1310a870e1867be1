//! Coordinator lifecycle.
//!
//! ```text
//! INIT → RUNNING → DRAINING → AGGREGATING → [REPORTING] → TERMINATED
//! ```
//!
//! [`Coordinator::start`] takes the singleton lock before anything else, so a
//! losing coordinator never touches the socket, scratch directory, or queue.
//! It then binds the control listener, prepares the scratch directory and
//! starts the pool. [`RunningCoordinator::serve_until_shutdown`] runs the
//! accept loop, drains the pool, aggregates, and optionally reports.
//!
//! Cleanup is carried by guards held in [`RunningCoordinator`]: on any exit
//! path the pool is stopped and joined first, then the scratch directory is
//! removed, then the lock is released.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregate::FinalAggregator;
use crate::config::{Isolation, ProfmergeConfig};
use crate::error::CoordinatorError;
use crate::listener::ControlListener;
use crate::lock::CoordinatorLock;
use crate::merge_tool::{ExternalMergeTool, MergeTool};
use crate::protocol::ControlProtocol;
use crate::queue::{IngestQueue, QueueItem};
use crate::report::{ReportGenerator, ReportOutcome};
use crate::worker::{
    InlineLauncher, ProcessLauncher, SessionSettings, WorkerLauncher, WorkerPool, WorkerReport,
    accumulator_path, is_accumulator_file,
};

// ---------------------------------------------------------------------------
// CoordinatorPhase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a coordinator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoordinatorPhase {
    /// Lock, socket, scratch, and pool being set up.
    Init,
    /// Accepting control messages; workers consuming.
    Running,
    /// Stop markers issued; waiting for every worker to exit.
    Draining,
    /// Merging accumulators into the final artifact.
    Aggregating,
    /// Running the optional coverage report.
    Reporting,
    /// Done, successfully or not.
    Terminated,
}

impl CoordinatorPhase {
    /// Returns `true` for [`Terminated`](Self::Terminated).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Phases reachable from this one. Every non-terminal phase may jump to
    /// `Terminated` on a fatal error; the report step is optional.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Init => &[Self::Running, Self::Terminated],
            Self::Running => &[Self::Draining, Self::Terminated],
            Self::Draining => &[Self::Aggregating, Self::Terminated],
            Self::Aggregating => &[Self::Reporting, Self::Terminated],
            Self::Reporting => &[Self::Terminated],
            Self::Terminated => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Aggregating => write!(f, "aggregating"),
            Self::Reporting => write!(f, "reporting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Outcome of a completed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Ingest requests accepted.
    pub ingested: usize,
    /// Per-worker results, by ordinal. Accumulator paths point into the
    /// scratch directory, which is gone unless `keep_scratch` is set.
    pub workers: Vec<WorkerReport>,
    /// Real items still queued when every worker had stopped.
    pub leftover: usize,
    /// The final artifact.
    pub final_artifact: PathBuf,
    /// Report step result.
    pub report: ReportOutcome,
}

impl RunSummary {
    /// Raw files merged across all workers.
    #[must_use]
    pub fn merged(&self) -> usize {
        self.workers.iter().map(|w| w.merged).sum()
    }

    /// Raw files skipped or lost across all workers.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.workers.iter().map(|w| w.skipped + w.lost).sum::<usize>() + self.leftover
    }

    fn log(&self) {
        info!(
            ingested = self.ingested,
            merged = self.merged(),
            dropped = self.dropped(),
            leftover = self.leftover,
            workers = self.workers.len(),
            final_artifact = %self.final_artifact.display(),
            "run complete"
        );
    }
}

// ---------------------------------------------------------------------------
// ScratchDir
// ---------------------------------------------------------------------------

/// Working directory for accumulators.
///
/// Only accumulator files are ever deleted from it. The directory itself is
/// removed on drop only if this run created it and nothing else is inside.
#[derive(Debug)]
struct ScratchDir {
    path: PathBuf,
    keep: bool,
    created: bool,
}

impl ScratchDir {
    fn create(path: PathBuf, keep: bool) -> Result<Self, CoordinatorError> {
        let created = !path.exists();
        if created {
            fs::create_dir_all(&path).map_err(|source| CoordinatorError::Scratch {
                path: path.clone(),
                source,
            })?;
        } else {
            // Accumulators left by a coordinator that did not exit cleanly
            // must not leak into this run.
            let stale = remove_accumulators(&path).map_err(|source| CoordinatorError::Scratch {
                path: path.clone(),
                source,
            })?;
            if stale > 0 {
                warn!(path = %path.display(), stale, "removed stale accumulators");
            }
        }
        Ok(Self {
            path,
            keep,
            created,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.keep {
            info!(path = %self.path.display(), "scratch directory kept");
            return;
        }
        if let Err(e) = remove_accumulators(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to clear scratch directory");
            return;
        }
        if self.created
            && let Err(e) = fs::remove_dir(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "scratch directory left in place");
        }
    }
}

/// Delete accumulator files directly inside `dir`; returns how many.
fn remove_accumulators(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_ours = entry.file_name().to_str().is_some_and(is_accumulator_file);
        if is_ours && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// A coordinator that has not started yet.
pub struct Coordinator {
    config: ProfmergeConfig,
    tool: Arc<dyn MergeTool>,
    worker_program: Option<PathBuf>,
}

impl Coordinator {
    /// Coordinator using the external merge tool from `config`.
    #[must_use]
    pub fn new(config: ProfmergeConfig) -> Self {
        let tool = Arc::new(ExternalMergeTool::from_config(&config.merge));
        Self {
            config,
            tool,
            worker_program: None,
        }
    }

    /// Replace the merge tool used by thread-isolated workers and the final
    /// aggregation. Process workers always run the configured external tool.
    #[must_use]
    pub fn with_merge_tool(mut self, tool: Arc<dyn MergeTool>) -> Self {
        self.tool = tool;
        self
    }

    /// Executable launched for process-isolated workers (default: the
    /// running executable).
    #[must_use]
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &ProfmergeConfig {
        &self.config
    }

    /// Start and serve until a shutdown request, then drain and aggregate.
    ///
    /// # Errors
    /// See [`start`](Self::start) and
    /// [`RunningCoordinator::serve_until_shutdown`].
    pub fn run(self) -> Result<RunSummary, CoordinatorError> {
        self.start()?.serve_until_shutdown()
    }

    /// Acquire the lock, bind, and start the pool.
    ///
    /// # Errors
    /// [`CoordinatorError::Config`] for an invalid configuration, then
    /// [`CoordinatorError::LockContention`] before any other setup if another
    /// coordinator is active; otherwise bind, scratch, or launch failures.
    /// Anything set up before a failure is torn down again.
    pub fn start(self) -> Result<RunningCoordinator, CoordinatorError> {
        self.config.validate()?;
        let settings = &self.config.coordinator;
        let lock = CoordinatorLock::acquire(&settings.lock_file)?;
        info!(
            pid = std::process::id(),
            lock = %lock.path().display(),
            workers = settings.workers,
            isolation = %settings.isolation,
            "coordinator starting"
        );

        let listener = ControlListener::bind(self.config.control.protocol())?;
        fs::create_dir_all(&settings.output_dir)?;
        let scratch = ScratchDir::create(settings.scratch_path(), settings.keep_scratch)?;

        let launcher: Arc<dyn WorkerLauncher> = match settings.isolation {
            Isolation::Thread => Arc::new(InlineLauncher::new(
                scratch.path().to_path_buf(),
                Arc::clone(&self.tool),
                SessionSettings::from_config(&self.config.merge),
            )),
            Isolation::Process => {
                let program = match self.worker_program {
                    Some(ref program) => program.clone(),
                    None => std::env::current_exe()?,
                };
                Arc::new(ProcessLauncher::new(
                    program,
                    scratch.path().to_path_buf(),
                    self.config.merge.clone(),
                ))
            }
        };
        let pool = WorkerPool::start(
            settings.workers,
            launcher,
            IngestQueue::new(),
            settings.max_worker_restarts,
        )?;

        let mut running = RunningCoordinator {
            pool,
            listener,
            scratch,
            lock,
            config: self.config,
            tool: self.tool,
            phase: CoordinatorPhase::Init,
        };
        running.transition(CoordinatorPhase::Running);
        Ok(running)
    }
}

/// A started coordinator: lock held, socket bound, workers consuming.
///
/// Field order is drop order: pool, listener, scratch, lock.
pub struct RunningCoordinator {
    pool: WorkerPool,
    listener: ControlListener,
    scratch: ScratchDir,
    lock: CoordinatorLock,
    config: ProfmergeConfig,
    tool: Arc<dyn MergeTool>,
    phase: CoordinatorPhase,
}

impl RunningCoordinator {
    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    /// Address the control listener is bound to.
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Protocol a client should use to reach this coordinator.
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn client_protocol(&self) -> io::Result<ControlProtocol> {
        self.listener.client_protocol()
    }

    /// Scratch directory holding the accumulators.
    #[must_use]
    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    fn transition(&mut self, next: CoordinatorPhase) {
        debug_assert!(
            self.phase.can_transition_to(&next),
            "invalid coordinator transition {} -> {next}",
            self.phase
        );
        info!(from = %self.phase, to = %next, "coordinator phase");
        self.phase = next;
    }

    /// Serve control messages until shutdown, then drain, aggregate, and
    /// report.
    ///
    /// # Errors
    /// [`CoordinatorError::NoDataCollected`] if no worker produced an
    /// accumulator, [`CoordinatorError::FinalMergeFailed`] if the final merge
    /// failed, or a listener or queue failure. The lock is released and the
    /// scratch directory removed in every case.
    pub fn serve_until_shutdown(mut self) -> Result<RunSummary, CoordinatorError> {
        let result = self.drive();
        if let Err(ref e) = result {
            error!(stage = %self.phase, error = %e, "coordinator run failed");
            if !self.phase.is_terminal() {
                self.transition(CoordinatorPhase::Terminated);
            }
        }
        let Self {
            pool,
            listener,
            scratch,
            mut lock,
            ..
        } = self;
        drop(pool);
        drop(listener);
        drop(scratch);
        lock.release();
        result
    }

    fn drive(&mut self) -> Result<RunSummary, CoordinatorError> {
        let ingested = self.listener.serve(&mut self.pool)?;
        self.transition(CoordinatorPhase::Draining);

        let size = self.pool.size();
        let workers = self.pool.drain()?;
        let leftover = discard_leftovers(self.pool.queue());
        info!(ingested, workers = size, leftover, "pool drained");

        self.transition(CoordinatorPhase::Aggregating);
        let candidates: Vec<PathBuf> = (0..size)
            .map(|ordinal| accumulator_path(self.scratch.path(), ordinal))
            .collect();
        let final_artifact = FinalAggregator::new(
            self.tool.as_ref(),
            self.config.coordinator.final_artifact_path(),
        )
        .aggregate(&candidates)?;

        let report = match ReportGenerator::from_config(
            &self.config.report,
            &self.config.coordinator.output_dir,
        ) {
            Some(generator) => {
                self.transition(CoordinatorPhase::Reporting);
                generator.generate(&final_artifact)
            }
            None => ReportOutcome::Skipped,
        };
        self.transition(CoordinatorPhase::Terminated);

        let summary = RunSummary {
            ingested,
            workers,
            leftover,
            final_artifact,
            report,
        };
        summary.log();
        Ok(summary)
    }
}

/// Empty all remaining items after the pool stopped. Only possible when a
/// slot retired early: its stop marker and any real items it would have
/// taken stay queued.
fn discard_leftovers(queue: &IngestQueue) -> usize {
    let mut leftover = 0;
    while let Some(item) = queue.try_dequeue() {
        if let QueueItem::Raw(raw) = item {
            warn!(file = %raw, stage = "drain", "raw file never merged: no live worker left");
            queue.mark_done();
            leftover += 1;
        }
    }
    leftover
}
