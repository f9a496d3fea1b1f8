#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use telemetry_ingestor::config::PipelineConfig;
use telemetry_ingestor::model::{FieldValue, Fields, RawTelemetry};
use telemetry_ingestor::pipeline::Pipeline;
use telemetry_ingestor::store::MemoryStore;

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        flush_interval: Duration::from_millis(20),
        max_batch_size: 500,
        write_timeout: Duration::from_millis(200),
        drain_initial_backoff: Duration::from_millis(10),
        drain_max_backoff: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        subscriber_buffer: 1024,
        offline_queue_path: None,
        offline_queue_warn_records: 1_000_000,
    }
}

pub fn pipeline(config: &PipelineConfig) -> (Pipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(config, store.clone()).unwrap();
    (pipeline, store)
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn reading(device: &str, secs: i64) -> RawTelemetry {
    let mut fields = Fields::new();
    fields.insert("latitude".to_string(), FieldValue::Number(52.0 + secs as f64 * 1e-4));
    fields.insert("longitude".to_string(), FieldValue::Number(4.9));
    fields.insert("speed".to_string(), FieldValue::Number(12.5));
    fields.insert("battery".to_string(), FieldValue::Number(87.0));
    fields.insert("network".to_string(), FieldValue::Text("lte".to_string()));
    RawTelemetry {
        device_id: Some(device.to_string()),
        timestamp: Some(ts(secs)),
        fields,
    }
}

pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
