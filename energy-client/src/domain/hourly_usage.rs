use time::OffsetDateTime;

use super::EnergyCounters;

/// One row of `hours_usage`: averaged interval usage for a
/// (location, meter type, meter serial number) group, tagged with the
/// aggregation tick that produced it.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct HourlyUsage {
    pub reading_time: OffsetDateTime,
    #[sqlx(rename = "position")]
    pub location: String,
    pub meter_type: String,
    pub meter_serial_number: String,
    #[sqlx(flatten)]
    pub usage: EnergyCounters,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredHourlyUsage {
    pub id: i64,
    #[sqlx(flatten)]
    pub hourly: HourlyUsage,
}
