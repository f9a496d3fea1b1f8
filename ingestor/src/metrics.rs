use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from the transport"
    ))
    .unwrap();
    pub static ref VALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_valid_messages_total",
        "Total valid messages after validation"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total invalid messages rejected"
    ))
    .unwrap();
    pub static ref STALE_UPDATES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_stale_updates_total",
        "Records older than the cached device state (persisted, not broadcast)"
    ))
    .unwrap();
    pub static ref RECORDS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_records_persisted_total",
        "Total records confirmed written to the store"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total store writes that failed as unreachable"
    ))
    .unwrap();
    pub static ref DB_REJECTED_RECORDS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_rejected_records_total",
        "Total records dropped because the store rejected their batch"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken to write a batch into the store"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Size of the batch currently being flushed"
    ))
    .unwrap();
    pub static ref OFFLINE_QUEUE_RECORDS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_offline_queue_records",
        "Records waiting in the offline queue"
    ))
    .unwrap();
    pub static ref OFFLINE_JOURNAL_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_offline_journal_errors_total",
        "Failed writes to the offline queue journal"
    ))
    .unwrap();
    pub static ref DRAIN_DEGRADED: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_drain_degraded",
        "1 while the store is degraded and the offline queue is draining"
    ))
    .unwrap();
    pub static ref STREAM_SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_stream_subscribers",
        "Connected event stream subscribers"
    ))
    .unwrap();
    pub static ref STREAM_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_stream_dropped_total",
        "Stream subscribers dropped because their buffer overflowed"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STALE_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECORDS_PERSISTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_REJECTED_RECORDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INGEST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(OFFLINE_QUEUE_RECORDS.clone()))?;
    REGISTRY.register(Box::new(OFFLINE_JOURNAL_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DRAIN_DEGRADED.clone()))?;
    REGISTRY.register(Box::new(STREAM_SUBSCRIBERS.clone()))?;
    REGISTRY.register(Box::new(STREAM_DROPPED_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
