/// The six energy quantities a meter reports.
///
/// On a `MeterReading` these are cumulative lifetime counters. On stored
/// sensor rows they hold per-interval differences, and on hourly usage rows
/// they hold the average of those differences.
#[derive(Debug, Clone, Copy, Default, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnergyCounters {
    pub active_energy_import: f64,
    pub active_energy_export: f64,
    pub reactive_energy_import: f64,
    pub reactive_energy_export: f64,
    pub apparent_energy_import: f64,
    pub apparent_energy_export: f64,
}

impl EnergyCounters {
    pub fn values(&self) -> [f64; 6] {
        [
            self.active_energy_import,
            self.active_energy_export,
            self.reactive_energy_import,
            self.reactive_energy_export,
            self.apparent_energy_import,
            self.apparent_energy_export,
        ]
    }

    pub fn from_values(v: [f64; 6]) -> Self {
        Self {
            active_energy_import: v[0],
            active_energy_export: v[1],
            reactive_energy_import: v[2],
            reactive_energy_export: v[3],
            apparent_energy_import: v[4],
            apparent_energy_export: v[5],
        }
    }
}
