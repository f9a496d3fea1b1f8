use crate::metrics::DRAIN_DEGRADED;
use crate::model::Batch;
use crate::offline_queue::OfflineQueue;
use crate::store::{StoreError, StoreWriter};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Healthy,
    Degraded,
}

const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Exponential retry schedule for the drain loop.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current.max(MIN_BACKOFF) * 2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

/// Owns every write to the store.
///
/// Flushed batches come in through [`submit`](Self::submit); while the store
/// is degraded, or anything is still queued, they go straight to the offline
/// queue so fresh data never overtakes backlog. The [`run`](Self::run) loop
/// retries the queue head on a backoff and removes entries one at a time in
/// FIFO order. `write_lock` makes the flush path and the drain loop mutually
/// exclusive.
pub struct RecoveryDrainManager {
    writer: StoreWriter,
    queue: Arc<OfflineQueue>,
    degraded: AtomicBool,
    write_lock: Mutex<()>,
    wake: Notify,
    backoff: Backoff,
}

impl RecoveryDrainManager {
    pub fn new(writer: StoreWriter, queue: Arc<OfflineQueue>, backoff: Backoff) -> Self {
        // A queue recovered from the journal means the store still owes us writes.
        let degraded = !queue.is_empty();
        DRAIN_DEGRADED.set(if degraded { 1.0 } else { 0.0 });

        let manager = Self {
            writer,
            queue,
            degraded: AtomicBool::new(degraded),
            write_lock: Mutex::new(()),
            wake: Notify::new(),
            backoff,
        };
        if degraded {
            manager.wake.notify_one();
        }
        manager
    }

    pub fn state(&self) -> DrainState {
        if self.degraded.load(Ordering::Acquire) {
            DrainState::Degraded
        } else {
            DrainState::Healthy
        }
    }

    /// Hands a flushed batch to the store, or to the offline queue when the
    /// store is down or backlog is pending.
    pub async fn submit(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let _guard = self.write_lock.lock().await;

        if self.state() == DrainState::Degraded || !self.queue.is_empty() {
            debug!(
                "Store degraded, queueing batch of {} records behind {} queued",
                batch.len(),
                self.queue.size()
            );
            self.enqueue(batch).await;
            self.wake.notify_one();
            return;
        }

        match self.writer.write(&batch).await {
            // Rejected batches were already logged and counted by the writer.
            Ok(()) | Err(StoreError::Rejected(_)) => {}
            Err(StoreError::Unreachable(reason)) => {
                self.enqueue(batch).await;
                self.mark_degraded(&reason);
                self.wake.notify_one();
            }
        }
    }

    /// Retry loop. Sleeps until something is queued, then drains on backoff.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting drain manager with initial_backoff={:?}, max_backoff={:?}",
            self.backoff.initial, self.backoff.max
        );

        let mut delay = self.backoff.initial;
        loop {
            if self.queue.is_empty() {
                self.wake.notified().await;
                continue;
            }

            tokio::time::sleep(delay).await;

            match self.drain_pending().await {
                Ok(drained) => {
                    if drained > 0 {
                        debug!("Drained {} offline batches", drained);
                    }
                    delay = self.backoff.initial;
                }
                Err(e) => {
                    delay = self.backoff.next(delay);
                    debug!(
                        "Drain attempt failed ({}), {} records queued, next attempt in {:?}",
                        e,
                        self.queue.size(),
                        delay
                    );
                }
            }
        }
    }

    /// Writes queued batches head-first until the queue is empty or the store
    /// fails again. Returns the number of batches persisted.
    async fn drain_pending(&self) -> Result<usize, StoreError> {
        let mut drained = 0;
        loop {
            let _guard = self.write_lock.lock().await;

            let Some(entry) = self.queue.peek() else {
                self.mark_healthy();
                return Ok(drained);
            };

            match self.writer.write(&entry.batch).await {
                Ok(()) => {
                    self.complete(entry.id).await;
                    drained += 1;
                }
                Err(StoreError::Rejected(_)) => {
                    self.complete(entry.id).await;
                }
                Err(e @ StoreError::Unreachable(_)) => {
                    self.queue.record_retry(entry.id);
                    return Err(e);
                }
            }

            if self.queue.is_empty() {
                self.mark_healthy();
                return Ok(drained);
            }
        }
    }

    // Queue mutations may fsync the journal, so they run on the blocking pool.
    // Callers hold `write_lock`, which keeps them in order.
    async fn enqueue(&self, batch: Batch) {
        let queue = self.queue.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || queue.enqueue(batch)).await {
            error!("Offline enqueue task failed: {}", e);
        }
    }

    async fn complete(&self, id: u64) {
        let queue = self.queue.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || queue.complete(id)).await {
            error!("Offline completion task failed: {}", e);
        }
    }

    fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            DRAIN_DEGRADED.set(1.0);
            warn!("Store unreachable, entering degraded mode: {}", reason);
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            DRAIN_DEGRADED.set(0.0);
            info!("Offline queue drained, store healthy again");
        }
    }
}
