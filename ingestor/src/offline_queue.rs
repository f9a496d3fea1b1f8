//! Ordered spill buffer for batches the store could not take.
//!
//! Entries leave the queue only after the drain manager confirms a successful
//! write, always from the head. `size()` reads an atomic record counter so the
//! stats endpoint never contends with the drain path.
//!
//! With a journal path configured every enqueue/ack is appended to a JSON-lines
//! file and fsynced, and the queue is rebuilt from it on startup.

use crate::errors::Result;
use crate::metrics::{OFFLINE_JOURNAL_ERRORS_TOTAL, OFFLINE_QUEUE_RECORDS};
use crate::model::Batch;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A queued batch plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct OfflineEntry {
    pub id: u64,
    pub batch: Arc<Batch>,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
}

pub struct OfflineQueue {
    entries: Mutex<VecDeque<OfflineEntry>>,
    records: AtomicU64,
    batches: AtomicUsize,
    next_id: AtomicU64,
    journal: Option<Mutex<Journal>>,
    warn_records: u64,
    over_watermark: AtomicBool,
}

impl OfflineQueue {
    pub fn in_memory(warn_records: u64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            records: AtomicU64::new(0),
            batches: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            journal: None,
            warn_records,
            over_watermark: AtomicBool::new(false),
        }
    }

    /// Opens (or creates) a journal-backed queue, replaying any entries a
    /// previous process left behind.
    pub fn open(path: impl AsRef<Path>, warn_records: u64) -> Result<Self> {
        let (journal, recovered) = Journal::open(path.as_ref())?;

        let mut queue = Self::in_memory(warn_records);
        let mut next_id = 1;
        let mut records = 0u64;
        let mut entries = VecDeque::with_capacity(recovered.len());
        for (id, batch) in recovered {
            next_id = next_id.max(id + 1);
            records += batch.len() as u64;
            entries.push_back(OfflineEntry {
                id,
                batch: Arc::new(batch),
                enqueued_at: Utc::now(),
                retries: 0,
            });
        }

        if !entries.is_empty() {
            info!(
                "Recovered {} offline batches ({} records) from {}",
                entries.len(),
                records,
                journal.path.display()
            );
        }

        queue.batches = AtomicUsize::new(entries.len());
        queue.records = AtomicU64::new(records);
        queue.entries = Mutex::new(entries);
        queue.next_id = AtomicU64::new(next_id);
        queue.journal = Some(Mutex::new(journal));
        queue.check_watermark();
        OFFLINE_QUEUE_RECORDS.set(records as f64);
        Ok(queue)
    }

    /// Appends a batch to the tail and returns its entry id. Blocks on the
    /// journal fsync when one is configured.
    pub fn enqueue(&self, batch: Batch) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let len = batch.len() as u64;

        {
            let mut entries = self.entries.lock();
            self.journal_append(&JournalOp::Enqueue {
                id,
                records: batch.clone(),
            });
            entries.push_back(OfflineEntry {
                id,
                batch: Arc::new(batch),
                enqueued_at: Utc::now(),
                retries: 0,
            });
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.records.fetch_add(len, Ordering::Relaxed);
        }

        OFFLINE_QUEUE_RECORDS.set(self.size() as f64);
        self.check_watermark();
        id
    }

    /// Oldest entry, left in place.
    pub fn peek(&self) -> Option<OfflineEntry> {
        self.entries.lock().front().cloned()
    }

    pub fn record_retry(&self, id: u64) {
        if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.id == id) {
            entry.retries += 1;
        }
    }

    /// Removes the head entry once its write is confirmed. Returns false if
    /// `id` is not the head (nothing is removed).
    pub fn complete(&self, id: u64) -> bool {
        {
            let mut entries = self.entries.lock();
            if entries.front().map(|head| head.id) != Some(id) {
                return false;
            }
            let Some(entry) = entries.pop_front() else {
                return false;
            };
            self.batches.fetch_sub(1, Ordering::Relaxed);
            self.records
                .fetch_sub(entry.batch.len() as u64, Ordering::Relaxed);
            if entries.is_empty() {
                self.journal_truncate();
            } else {
                self.journal_append(&JournalOp::Ack { id });
            }
        }

        OFFLINE_QUEUE_RECORDS.set(self.size() as f64);
        self.check_watermark();
        true
    }

    /// Number of queued records.
    pub fn size(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.batches() == 0
    }

    pub fn over_watermark(&self) -> bool {
        self.over_watermark.load(Ordering::Relaxed)
    }

    fn check_watermark(&self) {
        let size = self.size();
        if size >= self.warn_records {
            if !self.over_watermark.swap(true, Ordering::Relaxed) {
                warn!(
                    "Offline queue holds {} records (watermark {}), store outage is building memory pressure",
                    size, self.warn_records
                );
            }
        } else {
            self.over_watermark.store(false, Ordering::Relaxed);
        }
    }

    fn journal_append(&self, op: &JournalOp) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().append(op) {
                OFFLINE_JOURNAL_ERRORS_TOTAL.inc();
                error!("Failed to write offline journal: {}", e);
            }
        }
    }

    fn journal_truncate(&self) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.lock().truncate() {
                OFFLINE_JOURNAL_ERRORS_TOTAL.inc();
                error!("Failed to truncate offline journal: {}", e);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Enqueue { id: u64, records: Batch },
    Ack { id: u64 },
}

struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    fn open(path: &Path) -> Result<(Self, Vec<(u64, Batch)>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // A crash mid-append can cut a line inside a multi-byte character, so
        // lines are parsed as bytes rather than decoded as a whole.
        let lines: Vec<&[u8]> = contents
            .split(|b| *b == b'\n')
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
            .collect();
        let mut pending: Vec<(u64, Batch)> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_slice::<JournalOp>(line) {
                Ok(JournalOp::Enqueue { id, records }) => pending.push((id, records)),
                Ok(JournalOp::Ack { id }) => pending.retain(|(pid, _)| *pid != id),
                Err(e) if i + 1 == lines.len() => {
                    warn!("Ignoring truncated last line of offline journal: {}", e);
                }
                Err(e) => {
                    error!("Skipping corrupt offline journal line {}: {}", i + 1, e);
                }
            }
        }

        // Compact into a side file first; the rename makes the switch atomic.
        let mut compact_path = path.as_os_str().to_owned();
        compact_path.push(".compact");
        let compact_path = PathBuf::from(compact_path);
        {
            let mut compact = File::create(&compact_path)?;
            for (id, records) in &pending {
                let mut line = serde_json::to_vec(&JournalOp::Enqueue {
                    id: *id,
                    records: records.clone(),
                })?;
                line.push(b'\n');
                compact.write_all(&line)?;
            }
            compact.sync_all()?;
        }
        std::fs::rename(&compact_path, path)?;

        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok((
            Self {
                file,
                path: path.to_path_buf(),
            },
            pending,
        ))
    }

    fn append(&mut self, op: &JournalOp) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fields, TelemetryRecord};
    use chrono::TimeZone;

    fn batch(device: &str, range: std::ops::Range<i64>) -> Batch {
        Batch::new(
            range
                .map(|i| {
                    TelemetryRecord::new(
                        device.to_string(),
                        Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
                        Fields::new(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_fifo_and_record_count() {
        let queue = OfflineQueue::in_memory(u64::MAX);
        let first = queue.enqueue(batch("a", 0..3));
        let second = queue.enqueue(batch("b", 0..2));

        assert_eq!(queue.size(), 5);
        assert_eq!(queue.batches(), 2);
        assert_eq!(queue.peek().unwrap().id, first);

        // Only the head can be completed.
        assert!(!queue.complete(second));
        assert!(queue.complete(first));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().unwrap().id, second);

        assert!(queue.complete(second));
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = OfflineQueue::in_memory(u64::MAX);
        let id = queue.enqueue(batch("a", 0..1));
        queue.record_retry(id);
        queue.record_retry(id);

        let head = queue.peek().unwrap();
        assert_eq!(head.retries, 2);
        assert_eq!(queue.batches(), 1);
    }

    #[test]
    fn test_watermark_flag() {
        let queue = OfflineQueue::in_memory(4);
        let id = queue.enqueue(batch("a", 0..5));
        assert!(queue.over_watermark());

        queue.complete(id);
        assert!(!queue.over_watermark());
    }

    #[test]
    fn test_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.jsonl");

        {
            let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
            let first = queue.enqueue(batch("a", 0..3));
            queue.enqueue(batch("b", 0..2));
            queue.enqueue(batch("c", 0..1));
            assert!(queue.complete(first));
        }

        let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
        assert_eq!(queue.batches(), 2);
        assert_eq!(queue.size(), 3);
        let head = queue.peek().unwrap();
        assert_eq!(head.batch.records()[0].device_id(), "b");

        // New ids continue after recovered ones.
        let next = queue.enqueue(batch("d", 0..1));
        assert!(next > head.id);
    }

    #[test]
    fn test_journal_ignores_torn_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.jsonl");

        {
            let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
            queue.enqueue(batch("a", 0..2));
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"op":"enqueue","id":9,"records":[{"devi"#)
                .unwrap();
        }

        let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
        assert_eq!(queue.batches(), 1);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_journal_ignores_torn_multibyte_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.jsonl");

        {
            let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
            queue.enqueue(batch("a", 0..2));
        }
        {
            // Cut inside the two-byte "é".
            let mut tail = br#"{"op":"enqueue","id":2,"records":[{"device_id":"caf"#.to_vec();
            tail.push("é".as_bytes()[0]);
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&tail).unwrap();
        }

        let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
        assert_eq!(queue.batches(), 1);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().unwrap().batch.len(), 2);
    }

    #[test]
    fn test_journal_truncated_when_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.jsonl");

        let queue = OfflineQueue::open(&path, u64::MAX).unwrap();
        let id = queue.enqueue(batch("a", 0..2));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        queue.complete(id);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
