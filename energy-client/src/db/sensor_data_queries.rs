use anyhow::Result;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::domain::{SensorRecord, StoredSensorRecord};

const SENSOR_COLUMNS: &str = "reading_time, position, meter_type, meter_serial_number, \
     active_energy_import, active_energy_export, reactive_energy_import, \
     reactive_energy_export, apparent_energy_import, apparent_energy_export";

/// Insert one differential row.
pub async fn insert_sensor_record(pool: &PgPool, record: &SensorRecord) -> Result<()> {
    let u = &record.usage;
    sqlx::query(
        r#"
        INSERT INTO sensor_data (
            reading_time, position, meter_type, meter_serial_number,
            active_energy_import, active_energy_export, reactive_energy_import,
            reactive_energy_export, apparent_energy_import, apparent_energy_export
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(record.reading_time)
    .bind(&record.location)
    .bind(&record.meter_type)
    .bind(&record.meter_serial_number)
    .bind(u.active_energy_import)
    .bind(u.active_energy_export)
    .bind(u.reactive_energy_import)
    .bind(u.reactive_energy_export)
    .bind(u.apparent_energy_import)
    .bind(u.apparent_energy_export)
    .execute(pool)
    .await?;

    Ok(())
}

/// All differential rows with `start <= reading_time <= end`, across locations.
pub async fn readings_between(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<SensorRecord>> {
    let sql = format!(
        "SELECT {SENSOR_COLUMNS} FROM sensor_data \
         WHERE reading_time BETWEEN $1 AND $2 \
         ORDER BY reading_time"
    );

    let rows = sqlx::query_as::<_, SensorRecord>(&sql)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Historical rows for one location; either bound may be omitted.
pub async fn historical_readings(
    pool: &PgPool,
    location: &str,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
) -> Result<Vec<StoredSensorRecord>> {
    let mut builder = QueryBuilder::<Postgres>::new(format!(
        "SELECT id, {SENSOR_COLUMNS} FROM sensor_data WHERE position = "
    ));
    builder.push_bind(location);

    if let Some(start) = start {
        builder.push(" AND reading_time >= ").push_bind(start);
    }
    if let Some(end) = end {
        builder.push(" AND reading_time <= ").push_bind(end);
    }
    builder.push(" ORDER BY reading_time");

    let rows = builder
        .build_query_as::<StoredSensorRecord>()
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// The two most recent rows for a location, newest first.
pub async fn last_two_readings(pool: &PgPool, location: &str) -> Result<Vec<StoredSensorRecord>> {
    let sql = format!(
        "SELECT id, {SENSOR_COLUMNS} FROM sensor_data \
         WHERE position = $1 \
         ORDER BY reading_time DESC \
         LIMIT 2"
    );

    let rows = sqlx::query_as::<_, StoredSensorRecord>(&sql)
        .bind(location)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
