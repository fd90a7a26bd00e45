use std::{
    fs::File,
    path::{Path, PathBuf},
};

use csv::StringRecord;
use ecogrid_client::domain::RawReading;
use time::OffsetDateTime;

use super::InMemoryReadingStore;
use crate::pipeline::PipelineError;

/// Load a CSV reading export.
///
/// Expected header columns (by name):
/// - device_id
/// - timestamp or ts (RFC3339)
/// - power_w, energy_wh, voltage, temp_c (optional)
/// - occupancy (optional; true/false or 1/0)
///
/// A cell that does not parse is read as null, so a bad timestamp is rejected
/// by validation against its own device rather than lost.
pub async fn load_csv(path: impl Into<PathBuf>) -> Result<InMemoryReadingStore, PipelineError> {
    let path = path.into();
    // The csv reader is blocking.
    tokio::task::spawn_blocking(move || read_csv(&path))
        .await
        .map_err(|e| PipelineError::Store(format!("CSV load task failed: {e}")))?
}

fn read_csv(path: &Path) -> Result<InMemoryReadingStore, PipelineError> {
    let file = File::open(path)
        .map_err(|e| PipelineError::Store(format!("failed to open CSV file {}: {e}", path.display())))?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::Store(format!("failed to read CSV headers: {e}")))?
        .clone();

    if column(&headers, "device_id").is_none()
        || (column(&headers, "timestamp").is_none() && column(&headers, "ts").is_none())
    {
        return Err(PipelineError::Store(
            "CSV header must contain device_id and timestamp columns".to_string(),
        ));
    }

    let mut store = InMemoryReadingStore::new();
    for result in rdr.records() {
        match result {
            Ok(record) => store.push(record_to_raw_reading(&record, &headers)),
            Err(e) => {
                metrics::counter!("readings_parse_errors_total").increment(1);
                tracing::warn!(error = %e, "skipping unreadable CSV record");
                store.record_malformed();
            }
        }
    }

    tracing::info!(path = %path.display(), rows = store.len(), "loaded CSV readings");
    Ok(store)
}

fn column(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn parse_optional_f64(s: &str) -> Option<f64> {
    if s.trim().is_empty() {
        None
    } else {
        s.trim().parse().ok()
    }
}

fn parse_optional_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_optional_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn cell<'a>(record: &'a StringRecord, headers: &StringRecord, name: &str) -> &'a str {
    column(headers, name)
        .and_then(|idx| record.get(idx))
        .unwrap_or("")
}

fn record_to_raw_reading(record: &StringRecord, headers: &StringRecord) -> RawReading {
    let get = |name: &str| cell(record, headers, name);

    let ts_str = if column(headers, "timestamp").is_some() {
        get("timestamp")
    } else {
        get("ts")
    };
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339).ok();

    RawReading {
        ts,
        device_id: parse_optional_string(get("device_id")),
        power_w: parse_optional_f64(get("power_w")),
        energy_wh: parse_optional_f64(get("energy_wh")),
        voltage: parse_optional_f64(get("voltage")),
        temp_c: parse_optional_f64(get("temp_c")),
        occupancy: parse_optional_bool(get("occupancy")),
    }
}
