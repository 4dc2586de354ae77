use time::OffsetDateTime;

use super::StoredHourlyUsage;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AnomalySummary {
    pub id: i64,
    #[sqlx(rename = "position")]
    pub location: String,
    pub reading_time: OffsetDateTime,
    pub anomaly_type: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AnomalyDetail {
    #[sqlx(flatten)]
    pub usage: StoredHourlyUsage,
    pub anomaly_type: String,
    pub predicted_energy: Option<f64>,
}
