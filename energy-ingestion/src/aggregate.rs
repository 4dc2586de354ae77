//! Hourly usage summaries computed from persisted differential rows.
//!
//! A tick reads every row in its trailing window, groups by
//! (location, meter type, meter serial number), averages each metric and
//! writes one `hours_usage` row per group tagged with the tick time. It never
//! looks at the differencer's in-memory baselines.

use std::{collections::BTreeMap, sync::Arc};

use energy_client::domain::{EnergyCounters, HourlyUsage, SensorRecord};
use time::{Duration, OffsetDateTime};

use crate::{
    anomaly::AnomalyHook,
    config::AggregationConfig,
    storage::{EnergyStore, StorageError},
};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("aggregation window for tick {0} is out of range")]
    WindowOutOfRange(OffsetDateTime),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationReport {
    pub tick: OffsetDateTime,
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub rows_read: usize,
    pub groups: Vec<HourlyUsage>,
}

type GroupKey = (String, String, String);

/// Average every metric per group. Groups come out in key order.
pub fn summarize(tick: OffsetDateTime, rows: &[SensorRecord]) -> Vec<HourlyUsage> {
    let mut groups: BTreeMap<GroupKey, ([f64; 6], usize)> = BTreeMap::new();

    for row in rows {
        let key = (
            row.location.clone(),
            row.meter_type.clone(),
            row.meter_serial_number.clone(),
        );
        let (sums, count) = groups.entry(key).or_insert(([0.0; 6], 0));
        for (sum, v) in sums.iter_mut().zip(row.usage.values()) {
            *sum += v;
        }
        *count += 1;
    }

    groups
        .into_iter()
        .map(|((location, meter_type, meter_serial_number), (sums, count))| {
            let n = count as f64;
            HourlyUsage {
                reading_time: tick,
                location,
                meter_type,
                meter_serial_number,
                usage: EnergyCounters::from_values(sums.map(|s| s / n)),
            }
        })
        .collect()
}

pub struct Aggregator {
    store: Arc<dyn EnergyStore>,
    window: Duration,
    reading_clock_offset: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn EnergyStore>, window: Duration, reading_clock_offset: Duration) -> Self {
        Self {
            store,
            window,
            reading_clock_offset,
        }
    }

    pub fn from_config(cfg: &AggregationConfig, store: Arc<dyn EnergyStore>) -> Self {
        Self::new(
            store,
            Duration::seconds(i64::try_from(cfg.window_secs).unwrap_or(i64::MAX)),
            Duration::seconds(cfg.reading_clock_offset_secs),
        )
    }

    /// `[tick - window, tick]`, shifted onto the reading clock.
    pub fn window_for(&self, tick: OffsetDateTime) -> Result<(OffsetDateTime, OffsetDateTime), AggregateError> {
        let end = tick
            .checked_add(self.reading_clock_offset)
            .ok_or(AggregateError::WindowOutOfRange(tick))?;
        let start = end
            .checked_sub(self.window)
            .ok_or(AggregateError::WindowOutOfRange(tick))?;
        Ok((start, end))
    }

    pub async fn run_tick(&self, tick: OffsetDateTime) -> Result<AggregationReport, AggregateError> {
        let (window_start, window_end) = self.window_for(tick)?;
        let rows = self.store.readings_between(window_start, window_end).await?;
        let groups = summarize(tick, &rows);

        if !groups.is_empty() {
            self.store.insert_hourly_usage(&groups).await?;
        }

        metrics::counter!("aggregation_runs_total").increment(1);
        metrics::counter!("aggregation_groups_total").increment(groups.len() as u64);
        tracing::info!(
            %tick,
            %window_start,
            %window_end,
            rows = rows.len(),
            groups = groups.len(),
            "hourly usage saved"
        );

        Ok(AggregationReport {
            tick,
            window_start,
            window_end,
            rows_read: rows.len(),
            groups,
        })
    }
}

/// What runs on every scheduler tick: aggregation, then the optional
/// prediction hook. Failures are logged and never stop the schedule.
pub struct AggregationJob {
    pub aggregator: Aggregator,
    pub anomaly: Option<AnomalyHook>,
}

impl AggregationJob {
    pub async fn run(&self, tick: OffsetDateTime) {
        if let Err(e) = self.aggregator.run_tick(tick).await {
            tracing::error!(error = %e, %tick, "hourly aggregation failed");
            return;
        }
        if let Some(hook) = &self.anomaly {
            hook.run(tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use time::macros::datetime;

    fn row(location: &str, serial: &str, ts: OffsetDateTime, v: [f64; 6]) -> SensorRecord {
        SensorRecord {
            reading_time: ts,
            location: location.to_string(),
            meter_type: "PM2120".to_string(),
            meter_serial_number: serial.to_string(),
            usage: EnergyCounters::from_values(v),
        }
    }

    #[test]
    fn averages_each_metric_per_group() {
        let tick = datetime!(2024-01-01 10:05:00 UTC);
        let ts = datetime!(2024-01-01 09:30:00 UTC);
        let rows = vec![
            row("A", "SN-1", ts, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            row("A", "SN-1", ts, [3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
            row("B", "SN-9", ts, [10.0, 0.0, 0.0, 0.0, 0.0, -2.0]),
        ];

        let out = summarize(tick, &rows);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].location, "A");
        assert_eq!(out[0].reading_time, tick);
        assert_eq!(out[0].usage.values(), [2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(out[1].location, "B");
        assert_eq!(out[1].usage.apparent_energy_export, -2.0);
    }

    #[test]
    fn meter_serial_splits_groups() {
        let ts = datetime!(2024-01-01 09:30:00 UTC);
        let rows = vec![
            row("A", "SN-1", ts, [1.0; 6]),
            row("A", "SN-2", ts, [3.0; 6]),
        ];
        let out = summarize(ts, &rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].meter_serial_number, "SN-1");
        assert_eq!(out[1].usage.active_energy_import, 3.0);
    }

    #[test]
    fn empty_window_has_no_groups() {
        assert!(summarize(datetime!(2024-01-01 10:05:00 UTC), &[]).is_empty());
    }

    #[test]
    fn window_is_shifted_onto_reading_clock() {
        let agg = Aggregator::new(
            Arc::new(MemoryStore::new()),
            Duration::hours(1),
            Duration::hours(7),
        );
        let (start, end) = agg.window_for(datetime!(2024-01-01 03:05:00 UTC)).unwrap();
        assert_eq!(start, datetime!(2024-01-01 09:05:00 UTC));
        assert_eq!(end, datetime!(2024-01-01 10:05:00 UTC));
    }

    #[tokio::test]
    async fn oversized_window_is_an_error_not_a_panic() {
        let store = Arc::new(MemoryStore::new());
        let tick = datetime!(2024-01-01 10:05:00 UTC);

        let agg = Aggregator::new(store.clone(), Duration::seconds(100_000_000_000_000), Duration::ZERO);
        assert!(matches!(agg.window_for(tick), Err(AggregateError::WindowOutOfRange(t)) if t == tick));
        assert!(matches!(agg.run_tick(tick).await, Err(AggregateError::WindowOutOfRange(_))));

        let agg = Aggregator::new(store.clone(), Duration::hours(1), Duration::seconds(i64::MAX));
        assert!(agg.window_for(tick).is_err());
        assert!(store.hourly_rows().is_empty());
    }

    #[tokio::test]
    async fn tick_persists_summaries_tagged_with_tick_time() {
        let store = Arc::new(MemoryStore::new());
        let tick = datetime!(2024-01-01 10:05:00 UTC);
        for (ts, v) in [
            (datetime!(2024-01-01 09:04:59 UTC), 100.0),
            (datetime!(2024-01-01 09:05:00 UTC), 2.0),
            (datetime!(2024-01-01 09:40:00 UTC), 4.0),
            (datetime!(2024-01-01 10:05:00 UTC), 6.0),
        ] {
            store.save_sensor_record(&row("A", "SN-1", ts, [v; 6])).await.unwrap();
        }

        let agg = Aggregator::new(store.clone(), Duration::hours(1), Duration::ZERO);
        let report = agg.run_tick(tick).await.unwrap();

        assert_eq!(report.rows_read, 3);
        assert_eq!(report.groups.len(), 1);
        let stored = store.hourly_rows();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].hourly.reading_time, tick);
        assert_eq!(stored[0].hourly.usage.active_energy_import, 4.0);
    }

    #[tokio::test]
    async fn rerunning_a_window_duplicates_rows() {
        let store = Arc::new(MemoryStore::new());
        let tick = datetime!(2024-01-01 10:05:00 UTC);
        store
            .save_sensor_record(&row("A", "SN-1", datetime!(2024-01-01 09:30:00 UTC), [1.0; 6]))
            .await
            .unwrap();

        let agg = Aggregator::new(store.clone(), Duration::hours(1), Duration::ZERO);
        agg.run_tick(tick).await.unwrap();
        agg.run_tick(tick).await.unwrap();

        assert_eq!(store.hourly_rows().len(), 2);
    }
}
