use anyhow::Result;
use sqlx::PgPool;

use crate::domain::DeviceMetadata;

/// All registered devices, sorted by id.
pub async fn device_metadata(pool: &PgPool) -> Result<Vec<DeviceMetadata>> {
    let rows = sqlx::query_as::<_, DeviceMetadata>(
        r#"
        SELECT
            device_id,
            device_name,
            device_type,
            location,
            capacity_w,
            status
        FROM device_metadata
        ORDER BY device_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
