use std::{future::Future, time::Duration};

use energy_client::{
    db::{anomaly_queries, hours_usage_queries, sensor_data_queries, token_queries},
    domain::{AnomalyDetail, AnomalySummary, HourlyUsage, SensorRecord, StoredSensorRecord, UserToken},
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::{Date, OffsetDateTime};

use super::{EnergyStore, StorageError};

pub struct PgStore {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    pub async fn connect(
        uri: &str,
        max_connections: u32,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(Self::new(pool, max_retries, retry_backoff))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a write, retrying with linear backoff.
    async fn write_with_retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, what, "database write failed, retrying with backoff");
                    metrics::counter!("storage_write_retries_total").increment(1);
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, what, "database write failed, giving up");
                    metrics::counter!("storage_write_errors_total").increment(1);
                    return Err(StorageError::Backend(e));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl EnergyStore for PgStore {
    async fn save_sensor_record(&self, record: &SensorRecord) -> Result<(), StorageError> {
        self.write_with_retry("sensor_data", || {
            sensor_data_queries::insert_sensor_record(&self.pool, record)
        })
        .await
    }

    async fn readings_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorRecord>, StorageError> {
        Ok(sensor_data_queries::readings_between(&self.pool, start, end).await?)
    }

    async fn insert_hourly_usage(&self, rows: &[HourlyUsage]) -> Result<u64, StorageError> {
        self.write_with_retry("hours_usage", || {
            hours_usage_queries::insert_hourly_usage(&self.pool, rows)
        })
        .await
    }

    async fn recent_active_import(
        &self,
        location: &str,
        limit: usize,
    ) -> Result<Vec<f64>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(hours_usage_queries::recent_active_import(&self.pool, location, limit).await?)
    }

    async fn historical_readings(
        &self,
        location: &str,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<StoredSensorRecord>, StorageError> {
        Ok(sensor_data_queries::historical_readings(&self.pool, location, start, end).await?)
    }

    async fn last_two_readings(
        &self,
        location: &str,
    ) -> Result<Vec<StoredSensorRecord>, StorageError> {
        Ok(sensor_data_queries::last_two_readings(&self.pool, location).await?)
    }

    async fn anomalies(&self) -> Result<Vec<AnomalySummary>, StorageError> {
        Ok(anomaly_queries::anomalies(&self.pool).await?)
    }

    async fn anomaly_detail(&self, id: i64) -> Result<Option<AnomalyDetail>, StorageError> {
        Ok(anomaly_queries::anomaly_detail(&self.pool, id).await?)
    }

    async fn save_token(&self, token: &str, init_time: Date) -> Result<(), StorageError> {
        self.write_with_retry("user_token", || {
            token_queries::insert_token(&self.pool, token, init_time)
        })
        .await
    }

    async fn tokens_since(&self, cutoff: Date) -> Result<Vec<UserToken>, StorageError> {
        Ok(token_queries::tokens_since(&self.pool, cutoff).await?)
    }
}
