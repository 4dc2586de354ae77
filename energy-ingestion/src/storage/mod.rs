//! Durable storage behind one trait so ingestion, aggregation and the API
//! can run against PostgreSQL in production and memory in tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use energy_client::domain::{
    AnomalyDetail, AnomalySummary, HourlyUsage, SensorRecord, StoredSensorRecord, UserToken,
};
use time::{Date, OffsetDateTime};

use crate::config::{StorageConfig, StoreKind};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
    #[error("storage is misconfigured: {0}")]
    Config(String),
}

#[async_trait::async_trait]
pub trait EnergyStore: Send + Sync {
    async fn save_sensor_record(&self, record: &SensorRecord) -> Result<(), StorageError>;

    /// Differential rows with `start <= reading_time <= end`.
    async fn readings_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorRecord>, StorageError>;

    async fn insert_hourly_usage(&self, rows: &[HourlyUsage]) -> Result<u64, StorageError>;

    /// Latest `limit` hourly active-import averages, oldest first.
    async fn recent_active_import(
        &self,
        location: &str,
        limit: usize,
    ) -> Result<Vec<f64>, StorageError>;

    async fn historical_readings(
        &self,
        location: &str,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<StoredSensorRecord>, StorageError>;

    async fn last_two_readings(&self, location: &str)
        -> Result<Vec<StoredSensorRecord>, StorageError>;

    async fn anomalies(&self) -> Result<Vec<AnomalySummary>, StorageError>;

    async fn anomaly_detail(&self, id: i64) -> Result<Option<AnomalyDetail>, StorageError>;

    async fn save_token(&self, token: &str, init_time: Date) -> Result<(), StorageError>;

    /// Tokens registered on or after `cutoff`.
    async fn tokens_since(&self, cutoff: Date) -> Result<Vec<UserToken>, StorageError>;
}

pub async fn connect(cfg: &StorageConfig) -> Result<Arc<dyn EnergyStore>, StorageError> {
    match cfg.kind {
        StoreKind::Memory => {
            tracing::warn!("using in-memory storage; data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Postgres => {
            let uri = cfg
                .uri
                .as_deref()
                .ok_or_else(|| StorageError::Config("storage.uri is required for postgres".into()))?;
            let store = PgStore::connect(uri, cfg.max_connections, cfg.max_retries, cfg.retry_backoff())
                .await?;
            tracing::info!("database connected");
            Ok(Arc::new(store))
        }
    }
}
