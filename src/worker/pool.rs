//! Fixed-size pool of merge workers fed from the shared queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::error::CoordinatorError;
use crate::listener::ControlHandler;
use crate::queue::{IngestQueue, QueueError, QueueItem, RawFileRef};

use super::handle::{WorkerHandle, WorkerLauncher};
use super::MergeReply;

/// What one slot did over the run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Worker ordinal.
    pub ordinal: usize,
    /// Accumulator path, if the worker produced one.
    pub accumulator: Option<PathBuf>,
    /// Raw files merged.
    pub merged: usize,
    /// Raw files dropped after a per-file failure.
    pub skipped: usize,
    /// Raw files lost because the worker died while holding them.
    pub lost: usize,
    /// Times the worker was relaunched.
    pub restarts: u32,
    /// The slot stopped before receiving its stop marker.
    pub retired: bool,
}

/// Running pool. Dropping it without [`join`](Self::join) still stops and
/// joins every slot.
pub struct WorkerPool {
    queue: IngestQueue,
    launcher: Arc<dyn WorkerLauncher>,
    slots: Vec<JoinHandle<WorkerReport>>,
    stop_issued: bool,
    ingested: usize,
}

impl WorkerPool {
    /// Launch `size` workers and their slot threads.
    ///
    /// # Errors
    /// [`CoordinatorError::WorkerLaunch`] if a worker cannot be started.
    /// Workers started before the failure are stopped again.
    pub fn start(
        size: usize,
        launcher: Arc<dyn WorkerLauncher>,
        queue: IngestQueue,
        max_restarts: u32,
    ) -> Result<Self, CoordinatorError> {
        let mut pool = Self {
            queue,
            launcher,
            slots: Vec::with_capacity(size),
            stop_issued: false,
            ingested: 0,
        };
        for ordinal in 0..size {
            let handle = pool
                .launcher
                .launch(ordinal)
                .map_err(|source| CoordinatorError::WorkerLaunch { ordinal, source })?;
            let slot = Slot {
                ordinal,
                handle: Some(handle),
                launcher: Arc::clone(&pool.launcher),
                queue: pool.queue.clone(),
                max_restarts,
            };
            let thread = thread::Builder::new()
                .name(format!("merge-slot-{ordinal:02}"))
                .spawn(move || slot.run())
                .map_err(|source| CoordinatorError::WorkerLaunch { ordinal, source })?;
            pool.slots.push(thread);
        }
        info!(workers = size, "worker pool started");
        Ok(pool)
    }

    /// Number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// The shared work queue.
    #[must_use]
    pub const fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    /// Real items submitted through [`ControlHandler::on_ingest`].
    #[must_use]
    pub const fn ingested(&self) -> usize {
        self.ingested
    }

    /// Push one stop marker per slot. Only the first call has an effect.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the queue is gone.
    pub fn request_stop(&mut self) -> Result<(), QueueError> {
        if self.stop_issued {
            return Ok(());
        }
        self.stop_issued = true;
        self.queue.enqueue_stop_markers(self.slots.len())
    }

    /// Stop (if not yet requested) and wait for every slot to exit.
    ///
    /// Reports are ordered by ordinal. Afterwards the pool has no slots.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the stop markers could not be queued.
    pub fn drain(&mut self) -> Result<Vec<WorkerReport>, QueueError> {
        self.request_stop()?;
        Ok(self.join_slots())
    }

    /// [`drain`](Self::drain), consuming the pool.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the stop markers could not be queued.
    pub fn join(mut self) -> Result<Vec<WorkerReport>, QueueError> {
        self.drain()
    }

    fn join_slots(&mut self) -> Vec<WorkerReport> {
        std::mem::take(&mut self.slots)
            .into_iter()
            .enumerate()
            .map(|(ordinal, slot)| {
                slot.join().unwrap_or_else(|_| {
                    error!(worker = ordinal, "merge slot panicked");
                    WorkerReport {
                        ordinal,
                        accumulator: existing(self.launcher.accumulator_path(ordinal)),
                        retired: true,
                        ..WorkerReport::default()
                    }
                })
            })
            .collect()
    }
}

impl ControlHandler for WorkerPool {
    fn on_ingest(&mut self, raw: RawFileRef) -> Result<(), QueueError> {
        self.queue.enqueue(QueueItem::Raw(raw))?;
        self.ingested += 1;
        Ok(())
    }

    fn on_shutdown(&mut self) -> Result<(), QueueError> {
        self.request_stop()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        if let Err(e) = self.request_stop() {
            error!(error = %e, "could not stop worker pool");
            return;
        }
        let _ = self.join_slots();
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

struct Slot {
    ordinal: usize,
    handle: Option<Box<dyn WorkerHandle>>,
    launcher: Arc<dyn WorkerLauncher>,
    queue: IngestQueue,
    max_restarts: u32,
}

impl Slot {
    fn run(mut self) -> WorkerReport {
        let _span = info_span!("merge_slot", worker = self.ordinal).entered();
        let mut report = WorkerReport {
            ordinal: self.ordinal,
            ..WorkerReport::default()
        };

        while let Some(worker) = self.handle.as_mut() {
            let raw = match self.queue.dequeue() {
                Ok(QueueItem::Raw(raw)) => raw,
                Ok(QueueItem::Stop) | Err(_) => break,
            };
            let outcome = worker.submit(&raw);
            match outcome {
                Ok(MergeReply::Merged) => report.merged += 1,
                Ok(MergeReply::Skipped { .. }) => report.skipped += 1,
                Ok(MergeReply::Aborted { stage, reason }) => {
                    report.skipped += 1;
                    report.retired = true;
                    warn!(worker = self.ordinal, file = %raw, %stage, %reason, "worker aborted, slot retiring");
                }
                Err(lost) => {
                    report.lost += 1;
                    error!(
                        worker = self.ordinal,
                        file = %raw,
                        stage = "worker",
                        error = %lost,
                        "worker lost while merging, file dropped"
                    );
                    self.handle = None;
                    if report.restarts < self.max_restarts {
                        match self.launcher.launch(self.ordinal) {
                            Ok(fresh) => {
                                report.restarts += 1;
                                info!(worker = self.ordinal, restarts = report.restarts, "worker relaunched");
                                self.handle = Some(fresh);
                            }
                            Err(e) => {
                                error!(worker = self.ordinal, error = %e, "worker relaunch failed, slot retiring");
                            }
                        }
                    } else {
                        error!(worker = self.ordinal, restarts = report.restarts, "restart limit reached, slot retiring");
                    }
                    report.retired = self.handle.is_none();
                }
            }
            self.queue.mark_done();
            if report.retired {
                break;
            }
        }

        if let Some(worker) = self.handle.take()
            && let Err(e) = worker.shutdown()
        {
            warn!(worker = self.ordinal, error = %e, "worker did not exit cleanly");
        }
        report.accumulator = existing(self.launcher.accumulator_path(self.ordinal));
        info!(
            worker = self.ordinal,
            merged = report.merged,
            skipped = report.skipped,
            lost = report.lost,
            retired = report.retired,
            "merge slot finished"
        );
        report
    }
}
