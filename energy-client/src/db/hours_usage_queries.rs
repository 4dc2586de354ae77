use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::domain::HourlyUsage;

/// Insert summary rows in one statement. Returns the number of rows written.
pub async fn insert_hourly_usage(pool: &PgPool, rows: &[HourlyUsage]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO hours_usage (reading_time, position, meter_type, meter_serial_number, \
         active_energy_import, active_energy_export, reactive_energy_import, \
         reactive_energy_export, apparent_energy_import, apparent_energy_export) ",
    );
    builder.push_values(rows, |mut b, row| {
        let u = &row.usage;
        b.push_bind(row.reading_time)
            .push_bind(&row.location)
            .push_bind(&row.meter_type)
            .push_bind(&row.meter_serial_number)
            .push_bind(u.active_energy_import)
            .push_bind(u.active_energy_export)
            .push_bind(u.reactive_energy_import)
            .push_bind(u.reactive_energy_export)
            .push_bind(u.apparent_energy_import)
            .push_bind(u.apparent_energy_export);
    });

    let done = builder.build().execute(pool).await?;
    Ok(done.rows_affected())
}

/// The latest `limit` hourly active-import averages for a location,
/// returned oldest first so they can be fed to a model as a sequence.
pub async fn recent_active_import(pool: &PgPool, location: &str, limit: i64) -> Result<Vec<f64>> {
    let mut values: Vec<f64> = sqlx::query_scalar(
        r#"
        SELECT active_energy_import
        FROM hours_usage
        WHERE position = $1
        ORDER BY reading_time DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(location)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    values.reverse();
    Ok(values)
}
