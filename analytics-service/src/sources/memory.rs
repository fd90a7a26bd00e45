use std::collections::BTreeMap;

use ecogrid_client::domain::{DeviceMetadata, RawReading};
use futures::stream;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, ReadingStream, ReadingStore};

/// Reading store held entirely in memory, partitioned by device on insert.
///
/// Backs the file loaders and tests. Rows keep their insertion order as
/// `seq`, which is what breaks timestamp ties downstream.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadingStore {
    partitions: BTreeMap<String, Vec<Envelope<RawReading>>>,
    unkeyed: Vec<RawReading>,
    /// Input lines that could not be parsed into a reading at all.
    malformed: u64,
    devices: Vec<DeviceMetadata>,
    next_seq: u64,
}

impl InMemoryReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = RawReading>) -> Self {
        let mut store = Self::new();
        for row in rows {
            store.push(row);
        }
        store
    }

    pub fn with_devices(mut self, devices: Vec<DeviceMetadata>) -> Self {
        self.devices = devices;
        self
    }

    pub fn push(&mut self, row: RawReading) {
        let seq = self.next_seq;
        self.next_seq += 1;

        match row.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                let key = id.to_string();
                self.partitions
                    .entry(key)
                    .or_default()
                    .push(Envelope { payload: row, seq });
            }
            _ => self.unkeyed.push(row),
        }
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Vec::len).sum::<usize>() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest timestamp across all keyed rows.
    pub fn latest_ts(&self) -> Option<OffsetDateTime> {
        self.partitions
            .values()
            .flatten()
            .filter_map(|e| e.payload.ts)
            .max()
    }
}

// Rows without a timestamp stay in range so validation can count them.
fn in_range(row: &RawReading, start: OffsetDateTime, end: OffsetDateTime) -> bool {
    row.ts.map_or(true, |ts| ts >= start && ts <= end)
}

#[async_trait::async_trait]
impl ReadingStore for InMemoryReadingStore {
    async fn device_ids(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, PipelineError> {
        Ok(self
            .partitions
            .iter()
            .filter(|(_, rows)| rows.iter().any(|e| in_range(&e.payload, start, end)))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn scan(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ReadingStream, PipelineError> {
        let rows: Vec<Result<Envelope<RawReading>, PipelineError>> = self
            .partitions
            .get(device_id)
            .map(|rows| {
                rows.iter()
                    .filter(|e| in_range(&e.payload, start, end))
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Box::pin(stream::iter(rows)))
    }

    async fn device_metadata(&self) -> Result<Vec<DeviceMetadata>, PipelineError> {
        Ok(self.devices.clone())
    }

    async fn orphaned_rows(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<u64, PipelineError> {
        let unkeyed = self.unkeyed.iter().filter(|r| in_range(r, start, end)).count();
        Ok(unkeyed as u64 + self.malformed)
    }
}
