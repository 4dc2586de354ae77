use std::sync::{Mutex, MutexGuard, PoisonError};

use energy_client::domain::{
    AnomalyDetail, AnomalySummary, HourlyUsage, SensorRecord, StoredHourlyUsage,
    StoredSensorRecord, UserToken,
};
use time::{Date, OffsetDateTime};

use super::{EnergyStore, StorageError};

#[derive(Debug, Clone)]
struct AnomalyRow {
    hours_usage_id: i64,
    anomaly_type: String,
    predicted_energy: Option<f64>,
}

#[derive(Debug, Default)]
struct Tables {
    sensor_data: Vec<StoredSensorRecord>,
    hours_usage: Vec<StoredHourlyUsage>,
    anomaly_data: Vec<AnomalyRow>,
    user_token: Vec<UserToken>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store with the same query semantics as the PostgreSQL
/// backend. Used for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sensor_rows(&self) -> Vec<StoredSensorRecord> {
        self.tables().sensor_data.clone()
    }

    pub fn hourly_rows(&self) -> Vec<StoredHourlyUsage> {
        self.tables().hours_usage.clone()
    }

    /// Flag an hourly row as anomalous, as the external detector would.
    pub fn record_anomaly(
        &self,
        hours_usage_id: i64,
        anomaly_type: impl Into<String>,
        predicted_energy: Option<f64>,
    ) {
        self.tables().anomaly_data.push(AnomalyRow {
            hours_usage_id,
            anomaly_type: anomaly_type.into(),
            predicted_energy,
        });
    }
}

#[async_trait::async_trait]
impl EnergyStore for MemoryStore {
    async fn save_sensor_record(&self, record: &SensorRecord) -> Result<(), StorageError> {
        let mut t = self.tables();
        let id = t.next_id();
        t.sensor_data.push(StoredSensorRecord {
            id,
            record: record.clone(),
        });
        Ok(())
    }

    async fn readings_between(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<SensorRecord>, StorageError> {
        let mut rows: Vec<SensorRecord> = self
            .tables()
            .sensor_data
            .iter()
            .filter(|r| r.record.reading_time >= start && r.record.reading_time <= end)
            .map(|r| r.record.clone())
            .collect();
        rows.sort_by_key(|r| r.reading_time);
        Ok(rows)
    }

    async fn insert_hourly_usage(&self, rows: &[HourlyUsage]) -> Result<u64, StorageError> {
        let mut t = self.tables();
        for row in rows {
            let id = t.next_id();
            t.hours_usage.push(StoredHourlyUsage {
                id,
                hourly: row.clone(),
            });
        }
        Ok(rows.len() as u64)
    }

    async fn recent_active_import(
        &self,
        location: &str,
        limit: usize,
    ) -> Result<Vec<f64>, StorageError> {
        let t = self.tables();
        let mut rows: Vec<&StoredHourlyUsage> = t
            .hours_usage
            .iter()
            .filter(|r| r.hourly.location == location)
            .collect();
        rows.sort_by_key(|r| (r.hourly.reading_time, r.id));
        let skip = rows.len().saturating_sub(limit);
        Ok(rows
            .into_iter()
            .skip(skip)
            .map(|r| r.hourly.usage.active_energy_import)
            .collect())
    }

    async fn historical_readings(
        &self,
        location: &str,
        start: Option<OffsetDateTime>,
        end: Option<OffsetDateTime>,
    ) -> Result<Vec<StoredSensorRecord>, StorageError> {
        let mut rows: Vec<StoredSensorRecord> = self
            .tables()
            .sensor_data
            .iter()
            .filter(|r| r.record.location == location)
            .filter(|r| start.map_or(true, |s| r.record.reading_time >= s))
            .filter(|r| end.map_or(true, |e| r.record.reading_time <= e))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.record.reading_time);
        Ok(rows)
    }

    async fn last_two_readings(
        &self,
        location: &str,
    ) -> Result<Vec<StoredSensorRecord>, StorageError> {
        let mut rows = self.historical_readings(location, None, None).await?;
        rows.reverse();
        rows.truncate(2);
        Ok(rows)
    }

    async fn anomalies(&self) -> Result<Vec<AnomalySummary>, StorageError> {
        let t = self.tables();
        let mut out: Vec<AnomalySummary> = t
            .anomaly_data
            .iter()
            .filter_map(|a| {
                t.hours_usage
                    .iter()
                    .find(|h| h.id == a.hours_usage_id)
                    .map(|h| AnomalySummary {
                        id: h.id,
                        location: h.hourly.location.clone(),
                        reading_time: h.hourly.reading_time,
                        anomaly_type: a.anomaly_type.clone(),
                    })
            })
            .collect();
        out.sort_by(|a, b| b.reading_time.cmp(&a.reading_time));
        Ok(out)
    }

    async fn anomaly_detail(&self, id: i64) -> Result<Option<AnomalyDetail>, StorageError> {
        let t = self.tables();
        let Some(usage) = t.hours_usage.iter().find(|h| h.id == id) else {
            return Ok(None);
        };
        Ok(t
            .anomaly_data
            .iter()
            .find(|a| a.hours_usage_id == id)
            .map(|a| AnomalyDetail {
                usage: usage.clone(),
                anomaly_type: a.anomaly_type.clone(),
                predicted_energy: a.predicted_energy,
            }))
    }

    async fn save_token(&self, token: &str, init_time: Date) -> Result<(), StorageError> {
        self.tables().user_token.push(UserToken {
            token: token.to_string(),
            init_time,
        });
        Ok(())
    }

    async fn tokens_since(&self, cutoff: Date) -> Result<Vec<UserToken>, StorageError> {
        let mut rows: Vec<UserToken> = self
            .tables()
            .user_token
            .iter()
            .filter(|t| t.init_time >= cutoff)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.init_time);
        Ok(rows)
    }
}
