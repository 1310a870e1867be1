//! Joinable work queue between the control listener and the worker slots.
//!
//! [`IngestQueue`] is a multi-producer, multi-consumer FIFO over
//! `crossbeam-channel`. Every item goes to exactly one consumer; a consumer
//! that fails on an item never puts it back.
//!
//! On top of the channel sits a counter of real items that were enqueued but
//! not yet acknowledged with [`IngestQueue::mark_done`].
//! [`IngestQueue::wait_until_drained`] blocks until that counter reaches
//! zero. Stop markers are not counted: they carry no work.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// RawFileRef
// ---------------------------------------------------------------------------

/// Path of one producer's raw profile dump awaiting merge.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawFileRef(PathBuf);

impl RawFileRef {
    /// Wrap a path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The referenced path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RawFileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

/// One entry in the work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueItem {
    /// A raw file to merge.
    Raw(RawFileRef),
    /// Terminates the consumer that receives it.
    Stop,
}

// ---------------------------------------------------------------------------
// QueueError
// ---------------------------------------------------------------------------

/// The channel lost all its senders or receivers.
///
/// Cannot happen while an `IngestQueue` handle is alive, since each handle
/// owns both ends; kept as an error rather than a panic.
#[derive(Debug, Error)]
#[error("work queue disconnected")]
pub struct QueueError;

// ---------------------------------------------------------------------------
// IngestQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Unfinished {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Cloneable handle to the shared work queue.
#[derive(Clone, Debug)]
pub struct IngestQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    unfinished: Arc<Unfinished>,
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestQueue {
    /// Create an empty, unbounded queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            unfinished: Arc::new(Unfinished::default()),
        }
    }

    /// Append an item. Never blocks.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the channel is disconnected.
    pub fn enqueue(&self, item: QueueItem) -> Result<(), QueueError> {
        let is_real = matches!(item, QueueItem::Raw(_));
        if is_real {
            *self.lock_count() += 1;
        }
        if self.tx.send(item).is_err() {
            if is_real {
                self.finish_one();
            }
            return Err(QueueError);
        }
        Ok(())
    }

    /// Append `count` stop markers.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the channel is disconnected.
    pub fn enqueue_stop_markers(&self, count: usize) -> Result<(), QueueError> {
        for _ in 0..count {
            self.enqueue(QueueItem::Stop)?;
        }
        Ok(())
    }

    /// Take the next item, blocking while the queue is empty.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the channel is disconnected.
    pub fn dequeue(&self) -> Result<QueueItem, QueueError> {
        self.rx.recv().map_err(|_| QueueError)
    }

    /// Take the next item without blocking.
    #[must_use]
    pub fn try_dequeue(&self) -> Option<QueueItem> {
        self.rx.try_recv().ok()
    }

    /// Acknowledge that a dequeued real item has been fully handled.
    ///
    /// Call once per [`QueueItem::Raw`] taken from the queue, whatever the
    /// merge outcome. Never call it for a stop marker.
    pub fn mark_done(&self) {
        self.finish_one();
    }

    /// Block until every enqueued real item was dequeued and acknowledged.
    pub fn wait_until_drained(&self) {
        let mut count = self.lock_count();
        while *count > 0 {
            count = self
                .unfinished
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_until_drained`](Self::wait_until_drained) with a deadline.
    ///
    /// Returns `true` if the queue drained before `timeout` elapsed. A
    /// timeout too large to express as a deadline waits without one.
    #[must_use]
    pub fn wait_until_drained_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait_until_drained();
            return true;
        };
        let mut count = self.lock_count();
        while *count > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            count = self
                .unfinished
                .drained
                .wait_timeout(count, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Real items enqueued but not yet acknowledged.
    #[must_use]
    pub fn unfinished(&self) -> usize {
        *self.lock_count()
    }

    /// Items (real and stop markers) currently waiting in the channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no item is waiting in the channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn lock_count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.unfinished
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_one(&self) {
        let mut count = self.lock_count();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.unfinished.drained.notify_all();
        }
    }
}
