//! Fan-out of device changes and heartbeats to stream subscribers.
//!
//! Each subscription owns a bounded mpsc buffer. Publishing never waits: a
//! subscriber whose buffer is full is dropped from the registry (its stream
//! ends once the buffered events are consumed) so one slow client cannot
//! hold up the others.

use crate::metrics::{STREAM_DROPPED_TOTAL, STREAM_SUBSCRIBERS};
use crate::model::DeviceChange;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Change(DeviceChange),
    Heartbeat(DateTime<Utc>),
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<StreamEvent>>>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new subscription; it sees only events published after
    /// this call.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        STREAM_SUBSCRIBERS.set(count as f64);
        debug!("Stream subscriber {} registered ({} active)", id, count);

        Subscription {
            id,
            rx,
            broadcaster: Arc::clone(self),
        }
    }

    /// Pushes an event to every subscriber without waiting. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: StreamEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut overflowed = 0u64;

        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Stream subscriber {} is not keeping up, dropping it", id);
                    overflowed += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
            subscribers.len()
        };

        if overflowed > 0 {
            self.dropped.fetch_add(overflowed, Ordering::Relaxed);
            STREAM_DROPPED_TOTAL.inc_by(overflowed as f64);
        }
        STREAM_SUBSCRIBERS.set(count as f64);
        delivered
    }

    pub fn heartbeat(&self) -> usize {
        self.publish(StreamEvent::Heartbeat(Utc::now()))
    }

    /// Emits a heartbeat every `period`, independent of data traffic.
    pub async fn run_heartbeat(self: Arc<Self>, period: Duration) {
        info!("Starting stream heartbeat every {:?}", period);
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.heartbeat();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn unsubscribe(&self, id: u64) {
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(&id);
            subscribers.len()
        };
        STREAM_SUBSCRIBERS.set(count as f64);
    }
}

/// A live stream registration. Dropping it (client disconnect) removes it
/// from the registry right away.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<StreamEvent>>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription has been dropped by the
    /// broadcaster and its buffer is empty.
    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
        debug!("Stream subscriber {} released", self.id);
    }
}
