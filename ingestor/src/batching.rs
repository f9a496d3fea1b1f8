use crate::metrics::BATCH_SIZE;
use crate::model::{Batch, TelemetryRecord};
use crate::recovery::RecoveryDrainManager;
use crate::stats::PipelineCounters;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Unbounded working batch shared by ingest (append) and the flush
/// scheduler (swap).
#[derive(Debug)]
pub struct BatchBuffer {
    records: Mutex<Vec<TelemetryRecord>>,
    max_batch: usize,
    full: Notify,
}

impl BatchBuffer {
    pub fn new(max_batch: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            max_batch: max_batch.max(1),
            full: Notify::new(),
        }
    }

    /// Appends a record; wakes the scheduler once the size cap is reached.
    pub fn push(&self, record: TelemetryRecord) {
        let len = {
            let mut records = self.records.lock();
            records.push(record);
            records.len()
        };

        if len >= self.max_batch {
            self.full.notify_one();
        }
    }

    /// Swaps the working batch for an empty one in a single step.
    pub fn take(&self) -> Batch {
        let records = std::mem::take(&mut *self.records.lock());
        Batch::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

/// Moves the working batch to the drain manager on a timer or when the
/// buffer fills up.
pub struct FlushScheduler {
    buffer: Arc<BatchBuffer>,
    drain: Arc<RecoveryDrainManager>,
    counters: Arc<PipelineCounters>,
    flush_interval: Duration,
}

impl FlushScheduler {
    pub fn new(
        buffer: Arc<BatchBuffer>,
        drain: Arc<RecoveryDrainManager>,
        counters: Arc<PipelineCounters>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            buffer,
            drain,
            counters,
            flush_interval,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting flush scheduler with max_batch={}, flush_interval={:?}",
            self.buffer.max_batch, self.flush_interval
        );

        // `interval` panics on a zero period.
        let mut ticker = interval(self.flush_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.buffer.full.notified() => {
                    debug!("Batch size cap reached, flushing early");
                }
            }

            self.flush().await;
        }
    }

    /// Flushes whatever is buffered right now.
    pub async fn flush(&self) {
        let batch = self.buffer.take();
        let batch_len = batch.len();
        if batch_len == 0 {
            return;
        }

        debug!("Flushing batch of {} records", batch_len);
        BATCH_SIZE.set(batch_len as f64);
        self.counters.record_flush();

        self.drain.submit(batch).await;
        BATCH_SIZE.set(0.0);
    }
}
