pub mod anomaly;
pub mod energy;
pub mod hourly_usage;
pub mod meter_reading;
pub mod reading_time;
pub mod sensor_record;
pub mod user_token;

pub use anomaly::{AnomalyDetail, AnomalySummary};
pub use energy::EnergyCounters;
pub use hourly_usage::{HourlyUsage, StoredHourlyUsage};
pub use meter_reading::MeterReading;
pub use sensor_record::{SensorRecord, StoredSensorRecord};
pub use user_token::UserToken;
