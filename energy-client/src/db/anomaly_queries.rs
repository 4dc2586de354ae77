use anyhow::Result;
use sqlx::PgPool;

use crate::domain::{AnomalyDetail, AnomalySummary};

/// All flagged hours, newest first.
pub async fn anomalies(pool: &PgPool) -> Result<Vec<AnomalySummary>> {
    let rows = sqlx::query_as::<_, AnomalySummary>(
        r#"
        SELECT ad.hours_usage_id AS id, hu.position, hu.reading_time, ad.anomaly_type
        FROM anomaly_data ad
        JOIN hours_usage hu ON ad.hours_usage_id = hu.id
        ORDER BY hu.reading_time DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn anomaly_detail(pool: &PgPool, hours_usage_id: i64) -> Result<Option<AnomalyDetail>> {
    let row = sqlx::query_as::<_, AnomalyDetail>(
        r#"
        SELECT hu.*, ad.anomaly_type, ad.predicted_energy
        FROM hours_usage hu
        JOIN anomaly_data ad ON hu.id = ad.hours_usage_id
        WHERE hu.id = $1
        LIMIT 1
        "#,
    )
    .bind(hours_usage_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
