use crate::batching::BatchBuffer;
use crate::broadcast::{Broadcaster, StreamEvent, Subscription};
use crate::cache::DeviceStateCache;
use crate::errors::Result;
use crate::metrics::{INVALID_MESSAGES_TOTAL, STALE_UPDATES_TOTAL, VALID_MESSAGES_TOTAL};
use crate::model::{DeviceState, RawTelemetry, TelemetryRecord};
use crate::stats::PipelineCounters;
use crate::validate::{parse_payload, validate};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Entry point for telemetry coming off the transport.
///
/// Acceptance is synchronous and never touches the store: validate, update
/// the device cache, buffer the record for the next flush, and publish the
/// change to stream subscribers.
pub struct IngestGateway {
    cache: Arc<DeviceStateCache>,
    buffer: Arc<BatchBuffer>,
    broadcaster: Arc<Broadcaster>,
    counters: Arc<PipelineCounters>,
    /// Held shared while a cache update is published, exclusively while a
    /// subscriber takes its bootstrap snapshot.
    publish_gate: RwLock<()>,
}

impl IngestGateway {
    pub fn new(
        cache: Arc<DeviceStateCache>,
        buffer: Arc<BatchBuffer>,
        broadcaster: Arc<Broadcaster>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            cache,
            buffer,
            broadcaster,
            counters,
            publish_gate: RwLock::new(()),
        }
    }

    /// Accepts one transport payload (JSON).
    pub fn accept_payload(&self, payload: &[u8], topic_device: Option<&str>) -> Result<()> {
        match parse_payload(payload, topic_device) {
            Ok(record) => {
                self.accept_record(record);
                Ok(())
            }
            Err(e) => {
                self.reject();
                Err(e)
            }
        }
    }

    /// Accepts one already-decoded reading.
    pub fn accept(&self, raw: RawTelemetry) -> Result<()> {
        match validate(raw) {
            Ok(record) => {
                self.accept_record(record);
                Ok(())
            }
            Err(e) => {
                self.reject();
                Err(e)
            }
        }
    }

    fn accept_record(&self, record: TelemetryRecord) {
        {
            let _gate = self.publish_gate.read();
            match self.cache.apply(&record) {
                Some(change) => {
                    self.broadcaster.publish(StreamEvent::Change(change));
                }
                None => {
                    debug!(
                        "Stale record for {} at {}, cache unchanged",
                        record.device_id(),
                        record.timestamp()
                    );
                    STALE_UPDATES_TOTAL.inc();
                    self.counters.record_stale();
                }
            }
        }

        self.buffer.push(record);
        VALID_MESSAGES_TOTAL.inc();
        self.counters.record_ingested();
    }

    fn reject(&self) {
        INVALID_MESSAGES_TOTAL.inc();
        self.counters.record_rejected();
    }

    /// Current device states, for bootstrap via `/api/devices`.
    pub fn devices(&self) -> Vec<DeviceState> {
        self.cache.snapshot()
    }

    /// Registers a stream subscription.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Snapshot plus subscription taken atomically with respect to ingest:
    /// every change is either already in the snapshot or will arrive on the
    /// subscription, never both and never neither.
    pub fn subscribe_with_snapshot(&self) -> (Vec<DeviceState>, Subscription) {
        let _gate = self.publish_gate.write();
        (self.cache.snapshot(), self.broadcaster.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    fn gateway() -> (IngestGateway, Arc<BatchBuffer>, Arc<PipelineCounters>) {
        let buffer = Arc::new(BatchBuffer::new(1000));
        let counters = Arc::new(PipelineCounters::new());
        let gateway = IngestGateway::new(
            Arc::new(DeviceStateCache::new()),
            buffer.clone(),
            Arc::new(Broadcaster::new(16)),
            counters.clone(),
        );
        (gateway, buffer, counters)
    }

    #[test]
    fn test_accept_updates_cache_and_buffer() {
        let (gateway, buffer, counters) = gateway();
        let payload =
            br#"{"device_id":"X","timestamp":"2024-05-01T10:00:00Z","latitude":1.5,"longitude":2.5}"#;

        gateway.accept_payload(payload, None).unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(gateway.devices().len(), 1);
        assert_eq!(counters.messages_ingested(), 1);
    }

    #[test]
    fn test_invalid_record_does_not_affect_others() {
        let (gateway, buffer, counters) = gateway();

        let bad = br#"{"device_id":"","timestamp":"2024-05-01T10:00:00Z"}"#;
        assert!(matches!(
            gateway.accept_payload(bad, None),
            Err(Error::Validation(_))
        ));

        let good = br#"{"device_id":"Y","timestamp":"2024-05-01T10:00:00Z"}"#;
        gateway.accept_payload(good, None).unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(counters.messages_ingested(), 1);
        assert_eq!(gateway.devices()[0].device_id, "Y");
    }

    #[test]
    fn test_stale_record_is_buffered_but_not_broadcast() {
        tokio_test::block_on(async {
            let (gateway, buffer, _) = gateway();
            let mut sub = gateway.subscribe();

            let newer = br#"{"device_id":"X","timestamp":"2024-05-01T10:00:05Z","speed":4.0}"#;
            let older = br#"{"device_id":"X","timestamp":"2024-05-01T10:00:00Z","speed":1.0}"#;
            gateway.accept_payload(newer, None).unwrap();
            gateway.accept_payload(older, None).unwrap();

            assert_eq!(buffer.len(), 2);
            assert!(matches!(*sub.recv().await.unwrap(), StreamEvent::Change(_)));
            assert!(sub.try_recv().is_none());
        });
    }

    #[test]
    fn test_subscribe_with_snapshot_sees_prior_state() {
        let (gateway, _, _) = gateway();
        gateway
            .accept_payload(br#"{"device_id":"A","timestamp":"2024-05-01T10:00:00Z"}"#, None)
            .unwrap();

        let (snapshot, _sub) = gateway.subscribe_with_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].device_id, "A");
    }
}
