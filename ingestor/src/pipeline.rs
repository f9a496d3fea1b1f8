use crate::batching::{BatchBuffer, FlushScheduler};
use crate::broadcast::Broadcaster;
use crate::cache::DeviceStateCache;
use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::gateway::IngestGateway;
use crate::offline_queue::OfflineQueue;
use crate::recovery::{Backoff, RecoveryDrainManager};
use crate::stats::{PipelineCounters, StatsSurface};
use crate::store::{StoreWriter, TelemetryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

/// The assembled ingestion core: every component, each owned once and
/// shared by handle.
pub struct Pipeline {
    gateway: Arc<IngestGateway>,
    stats: StatsSurface,
    scheduler: Arc<FlushScheduler>,
    drain: Arc<RecoveryDrainManager>,
    broadcaster: Arc<Broadcaster>,
    heartbeat_interval: Duration,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig, store: Arc<dyn TelemetryStore>) -> Result<Self> {
        let counters = Arc::new(PipelineCounters::new());

        let queue = Arc::new(match &config.offline_queue_path {
            Some(path) => {
                info!("Offline queue journal: {}", path.display());
                OfflineQueue::open(path, config.offline_queue_warn_records)?
            }
            None => OfflineQueue::in_memory(config.offline_queue_warn_records),
        });

        let writer = StoreWriter::new(store, config.write_timeout, counters.clone());
        let drain = Arc::new(RecoveryDrainManager::new(
            writer,
            queue.clone(),
            Backoff {
                initial: config.drain_initial_backoff,
                max: config.drain_max_backoff,
            },
        ));

        let cache = Arc::new(DeviceStateCache::new());
        let buffer = Arc::new(BatchBuffer::new(config.max_batch_size));
        let broadcaster = Arc::new(Broadcaster::new(config.subscriber_buffer));

        let scheduler = Arc::new(FlushScheduler::new(
            buffer.clone(),
            drain.clone(),
            counters.clone(),
            config.flush_interval,
        ));
        let gateway = Arc::new(IngestGateway::new(
            cache.clone(),
            buffer.clone(),
            broadcaster.clone(),
            counters.clone(),
        ));
        let stats = StatsSurface::new(
            counters,
            queue,
            drain.clone(),
            buffer,
            cache,
            broadcaster.clone(),
        );

        Ok(Self {
            gateway,
            stats,
            scheduler,
            drain,
            broadcaster,
            heartbeat_interval: config.heartbeat_interval,
        })
    }

    /// Spawns the flush timer, drain loop and heartbeat. Dropping the
    /// returned set stops them.
    pub fn start(&self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.scheduler.clone().run());
        tasks.spawn(self.drain.clone().run());
        tasks.spawn(
            self.broadcaster
                .clone()
                .run_heartbeat(self.heartbeat_interval),
        );
        tasks
    }

    pub fn gateway(&self) -> Arc<IngestGateway> {
        self.gateway.clone()
    }

    pub fn stats(&self) -> StatsSurface {
        self.stats.clone()
    }

    /// Flushes the working batch now (used on shutdown).
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }
}
