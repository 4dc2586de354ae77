//! Turns cumulative meter counters into per-interval usage.
//!
//! Each configured location keeps exactly one baseline reading. A new reading
//! is differenced against that baseline and then always becomes the new
//! baseline, whatever the sign or size of the difference. A meter reset or
//! an out-of-order delivery therefore yields one negative interval and the
//! stream realigns on the next reading.

mod store;

pub use store::CounterStore;

use energy_client::domain::{EnergyCounters, MeterReading, SensorRecord};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("location '{0}' is not configured")]
    UnknownLocation(String),
}

/// Per-metric difference between two consecutive readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyDiff {
    pub active_energy_import_diff: f64,
    pub active_energy_export_diff: f64,
    pub reactive_energy_import_diff: f64,
    pub reactive_energy_export_diff: f64,
    pub apparent_energy_import_diff: f64,
    pub apparent_energy_export_diff: f64,
}

impl EnergyDiff {
    pub fn between(current: &EnergyCounters, previous: &EnergyCounters) -> Self {
        Self {
            active_energy_import_diff: current.active_energy_import - previous.active_energy_import,
            active_energy_export_diff: current.active_energy_export - previous.active_energy_export,
            reactive_energy_import_diff: current.reactive_energy_import
                - previous.reactive_energy_import,
            reactive_energy_export_diff: current.reactive_energy_export
                - previous.reactive_energy_export,
            apparent_energy_import_diff: current.apparent_energy_import
                - previous.apparent_energy_import,
            apparent_energy_export_diff: current.apparent_energy_export
                - previous.apparent_energy_export,
        }
    }

    pub fn has_negative(&self) -> bool {
        self.as_counters().values().iter().any(|v| *v < 0.0)
    }

    /// The differences laid out in counter order, as stored in `sensor_data`.
    pub fn as_counters(&self) -> EnergyCounters {
        EnergyCounters {
            active_energy_import: self.active_energy_import_diff,
            active_energy_export: self.active_energy_export_diff,
            reactive_energy_import: self.reactive_energy_import_diff,
            reactive_energy_export: self.reactive_energy_export_diff,
            apparent_energy_import: self.apparent_energy_import_diff,
            apparent_energy_export: self.apparent_energy_export_diff,
        }
    }
}

/// Interval usage for one location, tagged with the metadata of the reading
/// that closed the interval.
#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialRecord {
    pub reading_time: OffsetDateTime,
    pub meter_type: String,
    pub meter_serial_number: String,
    pub diff: EnergyDiff,
}

impl DifferentialRecord {
    pub fn into_sensor_record(self, location: &str) -> SensorRecord {
        SensorRecord {
            reading_time: self.reading_time,
            location: location.to_string(),
            meter_type: self.meter_type,
            meter_serial_number: self.meter_serial_number,
            usage: self.diff.as_counters(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    Delta(DifferentialRecord),
    /// First reading seen for the location; it is now the baseline.
    NoPreviousReading,
}

#[derive(Debug)]
pub struct Differencer {
    store: CounterStore,
}

impl Differencer {
    pub fn new(store: CounterStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn compute_delta(
        &self,
        location: &str,
        current: MeterReading,
    ) -> Result<DeltaOutcome, CoreError> {
        let mut baseline = self.store.lock(location)?;

        let outcome = match baseline.as_ref() {
            None => DeltaOutcome::NoPreviousReading,
            Some(previous) => {
                if previous.meter_serial_number != current.meter_serial_number {
                    tracing::warn!(
                        location,
                        previous = %previous.meter_serial_number,
                        current = %current.meter_serial_number,
                        "meter serial number changed between readings"
                    );
                }
                DeltaOutcome::Delta(DifferentialRecord {
                    reading_time: current.reading_time,
                    meter_type: current.meter_type.clone(),
                    meter_serial_number: current.meter_serial_number.clone(),
                    diff: EnergyDiff::between(&current.counters, &previous.counters),
                })
            }
        };

        *baseline = Some(current);
        Ok(outcome)
    }
}
