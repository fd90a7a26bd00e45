use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::{
    pipeline::{DeviceTables, PipelineError, RunTables, Sink},
    views::Views,
};

use super::questdb::{ANOMALIES_TABLE, DAILY_TABLE, FEATURES_TABLE, HOURLY_TABLE};

/// Writes one directory of NDJSON tables per device, plus the views:
///
/// ```text
/// <root>/devices/<device>/analytics_hourly.ndjson
/// <root>/devices/<device>/analytics_daily.ndjson
/// <root>/devices/<device>/ml_features.ndjson
/// <root>/devices/<device>/anomalies.ndjson
/// <root>/views/<view>.ndjson
/// ```
///
/// A device's tables are written into a hidden staging directory and swapped
/// in as a whole, so a reader never sees new hourly rows next to old features.
/// View files are replaced one at a time through a temporary sibling.
pub struct NdjsonDirSink {
    root: PathBuf,
}

impl NdjsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn devices_root(&self) -> PathBuf {
        self.root.join("devices")
    }

    pub fn device_dir(&self, device_id: &str) -> PathBuf {
        self.devices_root().join(file_stem(device_id))
    }

    pub fn device_file(&self, table: &str, device_id: &str) -> PathBuf {
        self.device_dir(device_id).join(format!("{table}.ndjson"))
    }

    pub fn view_file(&self, view: &str) -> PathBuf {
        self.root.join("views").join(format!("{view}.ndjson"))
    }
}

/// Escape a device id into a file stem. Characters outside `[A-Za-z0-9._-]`
/// become `%XX` per byte, which keeps distinct ids distinct.
fn file_stem(device_id: &str) -> String {
    let mut out = String::with_capacity(device_id.len());
    for b in device_id.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            // A leading dot would clash with the staging directories.
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn encode<T: Serialize>(rows: &[T]) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)
            .map_err(|e| PipelineError::Sink(format!("failed to encode row: {e}")))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> PipelineError + '_ {
    move |e| PipelineError::Sink(format!("{}: {e}", path.display()))
}

async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<(), PipelineError> {
    let dir = path
        .parent()
        .ok_or_else(|| PipelineError::Sink(format!("{} has no parent directory", path.display())))?;
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp, &bytes).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;

    metrics::counter!("ndjson_bytes_written_total").increment(bytes.len() as u64);
    Ok(())
}

async fn write_tables(dir: &Path, files: Vec<(&str, Vec<u8>)>) -> Result<(), PipelineError> {
    tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
    for (table, bytes) in files {
        let path = dir.join(format!("{table}.ndjson"));
        tokio::fs::write(&path, &bytes).await.map_err(io_error(&path))?;
        metrics::counter!("ndjson_bytes_written_total").increment(bytes.len() as u64);
    }
    Ok(())
}

/// Move `staging` to `live`, parking the previous `live` at `retired` until
/// the new directory is in place.
async fn swap_dir(staging: &Path, live: &Path, retired: &Path) -> Result<(), PipelineError> {
    // Leftover of an interrupted swap: restore it if it is all there is.
    if tokio::fs::try_exists(retired).await.map_err(io_error(retired))? {
        if tokio::fs::try_exists(live).await.map_err(io_error(live))? {
            tokio::fs::remove_dir_all(retired).await.map_err(io_error(retired))?;
        } else {
            tokio::fs::rename(retired, live).await.map_err(io_error(live))?;
        }
    }

    let had_live = match tokio::fs::rename(live, retired).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(io_error(live)(e)),
    };
    if let Err(e) = tokio::fs::rename(staging, live).await {
        if had_live {
            let _ = tokio::fs::rename(retired, live).await;
        }
        return Err(io_error(live)(e));
    }
    if had_live {
        if let Err(e) = tokio::fs::remove_dir_all(retired).await {
            tracing::warn!(path = %retired.display(), error = %e, "failed to remove replaced device tables");
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Sink for NdjsonDirSink {
    async fn publish(&self, t: &DeviceTables) -> Result<(), PipelineError> {
        let files = vec![
            (HOURLY_TABLE, encode(&t.hourly)?),
            (DAILY_TABLE, encode(&t.daily)?),
            (FEATURES_TABLE, encode(&t.features)?),
            (ANOMALIES_TABLE, encode(&t.anomalies)?),
        ];

        let devices_root = self.devices_root();
        let stem = file_stem(&t.device_id);
        let staging = devices_root.join(format!(".{stem}.staging"));
        let retired = devices_root.join(format!(".{stem}.old"));

        if let Err(e) = write_tables(&staging, files).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }
        swap_dir(&staging, &devices_root.join(&stem), &retired).await
    }

    async fn commit(&self, run: &RunTables<'_>) -> Result<(), PipelineError> {
        let devices_root = self.devices_root();
        let listed: HashSet<String> = run
            .recomputed
            .iter()
            .map(|t| file_stem(&t.device_id))
            .chain(run.failed.iter().map(|id| file_stem(id)))
            .collect();

        let mut entries = match tokio::fs::read_dir(&devices_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&devices_root)(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&devices_root))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || listed.contains(&name) {
                continue;
            }
            let path = entry.path();
            tokio::fs::remove_dir_all(&path).await.map_err(io_error(&path))?;
            tracing::info!(device = %name, "removed tables of a device no longer in the horizon");
        }
        Ok(())
    }

    async fn publish_views(&self, v: &Views) -> Result<(), PipelineError> {
        let files = [
            ("current_usage", encode(&v.current_usage)?),
            ("device_summary", encode(&v.device_summary)?),
            ("realtime_anomalies", encode(&v.realtime_anomalies)?),
            ("training_data", encode(&v.training_data)?),
        ];
        for (view, bytes) in files {
            write_atomic(&self.view_file(view), bytes).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AnalyticsConfig, pipeline::compute_partition};
    use ecogrid_client::domain::Reading;
    use time::{macros::datetime, Duration};

    fn tables(device: &str, n: i64) -> DeviceTables {
        let base = datetime!(2024-03-01 00:00:00 UTC);
        let readings = (0..n)
            .map(|i| Reading {
                ts: base + Duration::minutes(5 * i),
                device_id: device.to_string(),
                power_w: Some(100.0 + i as f64),
                energy_wh: Some(8.0),
                voltage: Some(230.0),
                temp_c: None,
                occupancy: Some(i % 2 == 0),
                ingest_seq: i as u64,
            })
            .collect();
        compute_partition(
            device.to_string(),
            readings,
            0,
            &AnalyticsConfig::default(),
            base + Duration::hours(6),
        )
    }

    #[test]
    fn file_stems_escape_unsafe_characters() {
        assert_eq!(file_stem("meter-01_a.b"), "meter-01_a.b");
        assert_eq!(file_stem("a/b"), "a%2Fb");
        assert_eq!(file_stem("a_b"), "a_b");
        assert_eq!(file_stem(".hidden"), "%2Ehidden");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn read_tables(sink: &NdjsonDirSink, device: &str) -> Vec<String> {
        [HOURLY_TABLE, DAILY_TABLE, FEATURES_TABLE, ANOMALIES_TABLE]
            .iter()
            .map(|table| std::fs::read_to_string(sink.device_file(table, device)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn republishing_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path());

        sink.publish(&tables("D1", 40)).await.unwrap();
        let first = std::fs::read_to_string(sink.device_file(FEATURES_TABLE, "D1")).unwrap();
        assert_eq!(first.lines().count(), 40);

        sink.publish(&tables("D1", 10)).await.unwrap();
        let second = std::fs::read_to_string(sink.device_file(FEATURES_TABLE, "D1")).unwrap();
        assert_eq!(second.lines().count(), 10);

        let hourly = std::fs::read_to_string(sink.device_file(HOURLY_TABLE, "D1")).unwrap();
        let row: serde_json::Value = serde_json::from_str(hourly.lines().next().unwrap()).unwrap();
        assert_eq!(row["hour_ts"], "2024-03-01T00:00:00Z");
        assert_eq!(row["severity"], "normal");

        // No staging or replaced directories are left behind.
        assert_eq!(listing(&dir.path().join("devices")), vec!["D1"]);
    }

    #[tokio::test]
    async fn a_failed_write_leaves_every_table_of_the_device_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path());

        sink.publish(&tables("D1", 40)).await.unwrap();
        let before = read_tables(&sink, "D1");

        // The third table cannot be written: its path is taken by a directory.
        let staging = dir.path().join("devices").join(".D1.staging");
        std::fs::create_dir_all(staging.join(format!("{FEATURES_TABLE}.ndjson"))).unwrap();

        let res = sink.publish(&tables("D1", 10)).await;
        assert!(matches!(res, Err(PipelineError::Sink(_))));

        assert_eq!(read_tables(&sink, "D1"), before);
        assert_eq!(before[2].lines().count(), 40);
        assert!(!staging.exists());

        // The next publish goes through once the obstruction is gone.
        sink.publish(&tables("D1", 10)).await.unwrap();
        assert_eq!(read_tables(&sink, "D1")[2].lines().count(), 10);
    }

    #[tokio::test]
    async fn an_interrupted_swap_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path());

        sink.publish(&tables("D1", 40)).await.unwrap();
        let devices = dir.path().join("devices");
        std::fs::rename(devices.join("D1"), devices.join(".D1.old")).unwrap();

        sink.publish(&tables("D1", 10)).await.unwrap();
        assert_eq!(read_tables(&sink, "D1")[2].lines().count(), 10);
        assert_eq!(listing(&devices), vec!["D1"]);
    }

    #[tokio::test]
    async fn commit_drops_devices_the_run_no_longer_lists() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path());

        for device in ["D1", "D2", "D3"] {
            sink.publish(&tables(device, 20)).await.unwrap();
        }

        let recomputed = vec![tables("D1", 20)];
        let failed = vec!["D3".to_string()];
        sink.commit(&RunTables {
            as_of: datetime!(2024-03-01 06:00:00 UTC),
            recomputed: &recomputed,
            failed: &failed,
        })
        .await
        .unwrap();

        assert_eq!(listing(&dir.path().join("devices")), vec!["D1", "D3"]);
        assert_eq!(read_tables(&sink, "D3")[2].lines().count(), 20);
    }

    #[tokio::test]
    async fn commit_without_prior_output_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path().join("fresh"));
        sink.commit(&RunTables {
            as_of: datetime!(2024-03-01 06:00:00 UTC),
            recomputed: &[],
            failed: &[],
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn empty_tables_still_produce_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonDirSink::new(dir.path());

        sink.publish(&tables("D1", 0)).await.unwrap();
        let anomalies = std::fs::read_to_string(sink.device_file(ANOMALIES_TABLE, "D1")).unwrap();
        assert!(anomalies.is_empty());
    }
}
