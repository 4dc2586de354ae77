use time::OffsetDateTime;

use super::EnergyCounters;

/// A point-in-time observation reported by one physical meter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterReading {
    #[cfg_attr(feature = "serde", serde(with = "crate::domain::reading_time::serde_format"))]
    pub reading_time: OffsetDateTime,
    pub meter_type: String,
    pub meter_serial_number: String,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub counters: EnergyCounters,
}
