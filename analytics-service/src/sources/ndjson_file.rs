use std::path::PathBuf;

use async_stream::try_stream;
use ecogrid_client::domain::{DeviceMetadata, RawReading};
use futures::{pin_mut, Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::InMemoryReadingStore;
use crate::pipeline::PipelineError;

/// Decode an NDJSON file line by line. Blank lines are skipped; a line that
/// fails to decode is yielded as the inner error so callers decide whether
/// it is fatal.
fn ndjson_records<T>(
    path: PathBuf,
) -> impl Stream<Item = Result<(usize, Result<T, serde_json::Error>), PipelineError>>
where
    T: DeserializeOwned,
{
    try_stream! {
        let file = File::open(&path).await.map_err(|e| {
            PipelineError::Store(format!("failed to open {}: {e}", path.display()))
        })?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await.map_err(|e| {
            PipelineError::Store(format!("failed to read {}: {e}", path.display()))
        })? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            yield (line_no, serde_json::from_str::<T>(&line));
        }
    }
}

/// Load an NDJSON reading export (one [`RawReading`] object per line).
///
/// Lines that do not decode are counted as orphaned rows instead of aborting
/// the load.
pub async fn load_ndjson(path: impl Into<PathBuf>) -> Result<InMemoryReadingStore, PipelineError> {
    let path = path.into();
    let records = ndjson_records::<RawReading>(path.clone());
    pin_mut!(records);

    let mut store = InMemoryReadingStore::new();
    while let Some(item) = records.next().await {
        match item? {
            (_, Ok(row)) => store.push(row),
            (line, Err(e)) => {
                metrics::counter!("readings_parse_errors_total").increment(1);
                tracing::warn!(path = %path.display(), line, error = %e, "skipping malformed reading line");
                store.record_malformed();
            }
        }
    }

    tracing::info!(path = %path.display(), rows = store.len(), "loaded NDJSON readings");
    Ok(store)
}

/// Load device metadata from NDJSON. Unlike readings, a malformed line fails
/// the load.
pub async fn load_devices_ndjson(
    path: impl Into<PathBuf>,
) -> Result<Vec<DeviceMetadata>, PipelineError> {
    let path = path.into();
    let records = ndjson_records::<DeviceMetadata>(path.clone());
    pin_mut!(records);

    let mut devices = Vec::new();
    while let Some(item) = records.next().await {
        let (line, parsed) = item?;
        let device = parsed.map_err(|e| {
            PipelineError::Store(format!("invalid device metadata at {}:{line}: {e}", path.display()))
        })?;
        devices.push(device);
    }
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Ok(devices)
}
