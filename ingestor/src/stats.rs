use crate::batching::BatchBuffer;
use crate::broadcast::Broadcaster;
use crate::cache::DeviceStateCache;
use crate::offline_queue::OfflineQueue;
use crate::recovery::{DrainState, RecoveryDrainManager};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cumulative counters shared by the ingest, flush and store paths.
///
/// Counters are lock-free; the three "last seen" values sit behind short
/// `parking_lot` locks that are never held across an await.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    messages_ingested: AtomicU64,
    messages_rejected: AtomicU64,
    stale_updates: AtomicU64,
    records_persisted: AtomicU64,
    records_store_rejected: AtomicU64,
    batches_flushed: AtomicU64,
    last_flush_time: Mutex<Option<DateTime<Utc>>>,
    last_write_time: Mutex<Option<DateTime<Utc>>>,
    last_store_error: Mutex<Option<String>>,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingested(&self) {
        self.messages_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        *self.last_flush_time.lock() = Some(Utc::now());
    }

    /// A write succeeded: the store is reachable again, so the last error is cleared.
    pub fn record_persisted(&self, records: u64) {
        self.records_persisted.fetch_add(records, Ordering::Relaxed);
        *self.last_write_time.lock() = Some(Utc::now());
        *self.last_store_error.lock() = None;
    }

    pub fn record_store_rejected(&self, records: u64, reason: &str) {
        self.records_store_rejected
            .fetch_add(records, Ordering::Relaxed);
        *self.last_store_error.lock() = Some(reason.to_string());
    }

    pub fn record_store_unreachable(&self, reason: &str) {
        *self.last_store_error.lock() = Some(reason.to_string());
    }

    pub fn messages_ingested(&self) -> u64 {
        self.messages_ingested.load(Ordering::Relaxed)
    }

    pub fn records_persisted(&self) -> u64 {
        self.records_persisted.load(Ordering::Relaxed)
    }

    pub fn records_store_rejected(&self) -> u64 {
        self.records_store_rejected.load(Ordering::Relaxed)
    }
}

/// Point-in-time view served by `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub offline_queue_size: u64,
    pub offline_queue_batches: usize,
    pub offline_queue_over_watermark: bool,
    pub pending_batch_size: usize,
    pub drain_state: DrainState,
    pub last_flush_time: Option<DateTime<Utc>>,
    pub last_successful_write_time: Option<DateTime<Utc>>,
    pub last_store_error: Option<String>,
    pub messages_ingested_total: u64,
    pub messages_rejected_total: u64,
    pub stale_updates_total: u64,
    pub records_persisted_total: u64,
    pub records_store_rejected_total: u64,
    pub batches_flushed_total: u64,
    pub known_devices: usize,
    pub stream_subscribers: usize,
    pub stream_subscribers_dropped_total: u64,
}

/// Read-only aggregation over the pipeline components.
#[derive(Clone)]
pub struct StatsSurface {
    counters: Arc<PipelineCounters>,
    queue: Arc<OfflineQueue>,
    drain: Arc<RecoveryDrainManager>,
    buffer: Arc<BatchBuffer>,
    cache: Arc<DeviceStateCache>,
    broadcaster: Arc<Broadcaster>,
}

impl StatsSurface {
    pub fn new(
        counters: Arc<PipelineCounters>,
        queue: Arc<OfflineQueue>,
        drain: Arc<RecoveryDrainManager>,
        buffer: Arc<BatchBuffer>,
        cache: Arc<DeviceStateCache>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            counters,
            queue,
            drain,
            buffer,
            cache,
            broadcaster,
        }
    }

    pub fn offline_queue_size(&self) -> u64 {
        self.queue.size()
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            offline_queue_size: self.queue.size(),
            offline_queue_batches: self.queue.batches(),
            offline_queue_over_watermark: self.queue.over_watermark(),
            pending_batch_size: self.buffer.len(),
            drain_state: self.drain.state(),
            last_flush_time: *c.last_flush_time.lock(),
            last_successful_write_time: *c.last_write_time.lock(),
            last_store_error: c.last_store_error.lock().clone(),
            messages_ingested_total: c.messages_ingested.load(Ordering::Relaxed),
            messages_rejected_total: c.messages_rejected.load(Ordering::Relaxed),
            stale_updates_total: c.stale_updates.load(Ordering::Relaxed),
            records_persisted_total: c.records_persisted.load(Ordering::Relaxed),
            records_store_rejected_total: c.records_store_rejected.load(Ordering::Relaxed),
            batches_flushed_total: c.batches_flushed.load(Ordering::Relaxed),
            known_devices: self.cache.len(),
            stream_subscribers: self.broadcaster.subscriber_count(),
            stream_subscribers_dropped_total: self.broadcaster.dropped_total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_clears_last_error() {
        let counters = PipelineCounters::new();
        counters.record_store_unreachable("connection refused");
        assert_eq!(
            counters.last_store_error.lock().as_deref(),
            Some("connection refused")
        );

        counters.record_persisted(5);
        assert!(counters.last_store_error.lock().is_none());
        assert_eq!(counters.records_persisted(), 5);
        assert!(counters.last_write_time.lock().is_some());
    }

    #[test]
    fn test_rejected_records_are_counted_separately() {
        let counters = PipelineCounters::new();
        counters.record_persisted(10);
        counters.record_store_rejected(3, "invalid input syntax");

        assert_eq!(counters.records_persisted(), 10);
        assert_eq!(counters.records_store_rejected(), 3);
    }
}
