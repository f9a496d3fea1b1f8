use crate::metrics::{
    DB_FAILURES_TOTAL, DB_REJECTED_RECORDS_TOTAL, INGEST_LATENCY_SECONDS, RECORDS_PERSISTED_TOTAL,
};
use crate::model::{Batch, Fields, TelemetryRecord};
use crate::stats::PipelineCounters;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Classified store failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, timed out or dropped. Always retried.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The store refused the data itself. Never retried.
    #[error("store rejected batch: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

/// Backing time-series store.
///
/// Implementations must insert with ignore-on-conflict semantics on the
/// (device_id, timestamp) natural key, so replaying a batch never creates a
/// second row. Returns the number of rows actually inserted.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_batch(&self, records: &[TelemetryRecord]) -> Result<u64, StoreError>;
}

/// Performs bounded-time batch writes and accounts for their outcome.
#[derive(Clone)]
pub struct StoreWriter {
    store: Arc<dyn TelemetryStore>,
    write_timeout: Duration,
    counters: Arc<PipelineCounters>,
}

impl StoreWriter {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        write_timeout: Duration,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            store,
            write_timeout,
            counters,
        }
    }

    /// Writes the whole batch or reports why it could not.
    ///
    /// `Rejected` batches are logged and counted here; the caller only has to
    /// stop holding on to them.
    pub async fn write(&self, batch: &Batch) -> Result<(), StoreError> {
        let batch_len = batch.len();
        if batch_len == 0 {
            return Ok(());
        }

        let start = Instant::now();
        let outcome = match tokio::time::timeout(
            self.write_timeout,
            self.store.insert_batch(batch.records()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unreachable(format!(
                "write timed out after {:?}",
                self.write_timeout
            ))),
        };

        match outcome {
            Ok(inserted) => {
                let elapsed = start.elapsed().as_secs_f64();
                INGEST_LATENCY_SECONDS.observe(elapsed);
                RECORDS_PERSISTED_TOTAL.inc_by(batch_len as f64);
                self.counters.record_persisted(batch_len as u64);
                if inserted < batch_len as u64 {
                    debug!(
                        "Batch of {} records written in {:.3}s, {} already present",
                        batch_len,
                        elapsed,
                        batch_len as u64 - inserted
                    );
                } else {
                    debug!("Batch of {} records written in {:.3}s", batch_len, elapsed);
                }
                Ok(())
            }
            Err(StoreError::Unreachable(reason)) => {
                DB_FAILURES_TOTAL.inc();
                self.counters.record_store_unreachable(&reason);
                warn!("Store unreachable while writing {} records: {}", batch_len, reason);
                Err(StoreError::Unreachable(reason))
            }
            Err(StoreError::Rejected(reason)) => {
                DB_REJECTED_RECORDS_TOTAL.inc_by(batch_len as f64);
                self.counters
                    .record_store_rejected(batch_len as u64, &reason);
                error!("Store rejected batch, dropping {} records: {}", batch_len, reason);
                Err(StoreError::Rejected(reason))
            }
        }
    }
}

/// In-process store keyed by natural key. Backs the resilience tests and can
/// simulate outages (`set_available(false)`) and data-level rejection.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<MemoryRows>,
    available: AtomicBool,
    rejecting: AtomicBool,
    write_attempts: AtomicU64,
    write_delay: Mutex<Option<Duration>>,
}

#[derive(Debug, Default)]
struct MemoryRows {
    by_key: HashMap<(String, DateTime<Utc>), Fields>,
    /// Natural keys in the order they were first inserted.
    order: Vec<(String, DateTime<Utc>)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(MemoryRows::default()),
            available: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            write_attempts: AtomicU64::new(0),
            write_delay: Mutex::new(None),
        }
    }

    pub fn set_available(&self, available: bool) {
        info!(available, "Memory store availability changed");
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Delays every write, to exercise the writer timeout.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().order.len()
    }

    pub fn rows_for_device(&self, device_id: &str) -> usize {
        self.rows
            .lock()
            .order
            .iter()
            .filter(|(id, _)| id == device_id)
            .count()
    }

    pub fn contains(&self, device_id: &str, timestamp: DateTime<Utc>) -> bool {
        self.rows
            .lock()
            .by_key
            .contains_key(&(device_id.to_string(), timestamp))
    }

    /// Timestamps of one device's rows in insertion order.
    pub fn insertion_order(&self, device_id: &str) -> Vec<DateTime<Utc>> {
        self.rows
            .lock()
            .order
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, ts)| *ts)
            .collect()
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_batch(&self, records: &[TelemetryRecord]) -> Result<u64, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable("connection refused".to_string()));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("malformed row".to_string()));
        }

        let mut rows = self.rows.lock();
        let mut inserted = 0;
        for record in records {
            let (device_id, timestamp) = record.key();
            let key = (device_id.to_string(), timestamp);
            if rows.by_key.contains_key(&key) {
                continue;
            }
            rows.by_key.insert(key.clone(), record.fields().clone());
            rows.order.push(key);
            inserted += 1;
        }
        Ok(inserted)
    }
}
