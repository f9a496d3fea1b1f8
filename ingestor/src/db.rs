use crate::errors::Result;
use crate::model::TelemetryRecord;
use crate::store::{StoreError, TelemetryStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Postgres-backed telemetry store.
///
/// The pool connects lazily so the ingestor starts (and buffers) while the
/// database is down; migrations run on the first write that reaches it.
pub struct PgStore {
    pool: PgPool,
    migrated: AtomicBool,
    migrate_lock: tokio::sync::Mutex<()>,
}

impl PgStore {
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;

        Ok(Self {
            pool,
            migrated: AtomicBool::new(false),
            migrate_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Runs migrations once; later calls return immediately.
    pub async fn ensure_schema(&self) -> std::result::Result<(), StoreError> {
        if self.migrated.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.migrate_lock.lock().await;
        if self.migrated.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::migrate::MigrateError::Execute(err) => classify(err),
                other => StoreError::Unreachable(format!("migration failed: {}", other)),
            })?;
        self.migrated.store(true, Ordering::Release);
        info!("Migrations completed");
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn insert_batch(
        &self,
        batch: &[TelemetryRecord],
    ) -> std::result::Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        self.ensure_schema().await?;

        let device_ids: Vec<&str> = batch.iter().map(|t| t.device_id()).collect();
        let timestamps: Vec<chrono::DateTime<chrono::Utc>> =
            batch.iter().map(|t| t.timestamp()).collect();
        let fields = batch
            .iter()
            .map(|t| serde_json::to_value(t.fields()))
            .collect::<std::result::Result<Vec<serde_json::Value>, _>>()
            .map_err(|e| StoreError::Rejected(format!("fields not serializable: {}", e)))?;

        let query = r#"
        INSERT INTO telemetry (device_id, ts, fields)
        SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::jsonb[])
        ON CONFLICT (device_id, ts) DO NOTHING
        "#;

        let result = sqlx::query(query)
            .bind(&device_ids)
            .bind(&timestamps)
            .bind(&fields)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        Ok(result.rows_affected())
    }
}

fn classify(err: sqlx::Error) -> StoreError {
    if is_transient_error(&err) {
        StoreError::Unreachable(err.to_string())
    } else {
        warn!("Non-transient database error: {}", err);
        StoreError::Rejected(err.to_string())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code.starts_with("08") || // connection_exception class
                code == "57P01" || // admin_shutdown
                code == "57P02" || // crash_shutdown
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" || // serialization_failure
                code == "40P01" // deadlock_detected
            })
        }
        _ => false,
    }
}
