use anyhow::Result;
use futures::stream::BoxStream;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::RawReading;

/// Stream the time-ordered readings of a single device within `[start, end]`.
///
/// Rows sharing a timestamp come back in storage (arrival) order.
pub fn scan_readings<'a>(
    pool: &'a PgPool,
    device_id: &'a str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> BoxStream<'a, Result<RawReading, sqlx::Error>> {
    sqlx::query_as::<_, RawReading>(
        r#"
        SELECT
            ts,
            device_id,
            power_w,
            energy_wh,
            voltage,
            temp_c,
            occupancy
        FROM raw_readings
        WHERE device_id = $1
          AND ts >= $2
          AND ts <= $3
        ORDER BY ts
        "#,
    )
    .bind(device_id)
    .bind(start)
    .bind(end)
    .fetch(pool)
}

/// Devices with at least one reading in `[start, end]`, sorted by id.
pub async fn device_ids_in_range(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"
        SELECT DISTINCT device_id
        FROM raw_readings
        WHERE ts >= $1
          AND ts <= $2
          AND device_id IS NOT NULL
        ORDER BY device_id
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Count readings in `[start, end]` that carry no device id and so can never
/// join a device partition.
pub async fn count_unkeyed_readings(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT count(*)
        FROM raw_readings
        WHERE ts >= $1
          AND ts <= $2
          AND device_id IS NULL
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await?;

    Ok(u64::try_from(count).unwrap_or(0))
}
