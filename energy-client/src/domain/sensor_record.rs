use time::OffsetDateTime;

use super::EnergyCounters;

/// One row of `sensor_data`: the interval usage of a location between two
/// consecutive meter readings.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorRecord {
    pub reading_time: OffsetDateTime,
    #[sqlx(rename = "position")]
    pub location: String,
    pub meter_type: String,
    pub meter_serial_number: String,
    #[sqlx(flatten)]
    pub usage: EnergyCounters,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredSensorRecord {
    pub id: i64,
    #[sqlx(flatten)]
    pub record: SensorRecord,
}
