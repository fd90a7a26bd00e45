use async_stream::try_stream;
use ecogrid_client::{
    db::{device_queries, reading_queries},
    domain::DeviceMetadata,
};
use futures::TryStreamExt;
use sqlx::postgres::PgPool;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, ReadingStore, ReadingStream};

/// `raw_readings` and `device_metadata` read over QuestDB's Postgres wire
/// protocol.
pub struct QuestDbReadingStore {
    pool: PgPool,
}

impl QuestDbReadingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Store(e.to_string())
}

#[async_trait::async_trait]
impl ReadingStore for QuestDbReadingStore {
    async fn device_ids(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, PipelineError> {
        reading_queries::device_ids_in_range(&self.pool, start, end)
            .await
            .map_err(store_err)
    }

    async fn scan(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ReadingStream, PipelineError> {
        let pool = self.pool.clone();
        let device_id = device_id.to_string();

        let s = try_stream! {
            let mut rows = reading_queries::scan_readings(&pool, &device_id, start, end);
            let mut seq: u64 = 0;
            while let Some(row) = rows.try_next().await.map_err(store_err)? {
                yield Envelope { payload: row, seq };
                seq += 1;
            }
        };

        Ok(Box::pin(s))
    }

    async fn device_metadata(&self) -> Result<Vec<DeviceMetadata>, PipelineError> {
        device_queries::device_metadata(&self.pool)
            .await
            .map_err(store_err)
    }

    async fn orphaned_rows(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<u64, PipelineError> {
        reading_queries::count_unkeyed_readings(&self.pool, start, end)
            .await
            .map_err(store_err)
    }
}
