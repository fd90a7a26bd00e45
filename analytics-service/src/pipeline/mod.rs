use std::{
    any::Any,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use ecogrid_client::domain::{DeviceMetadata, RawReading, Reading};
use futures::{stream, FutureExt, Stream, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{config::AnalyticsConfig, transform::ReadingValidation, views::Views};

mod partition;

pub use partition::{compute_partition, DeviceTables};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    /// Arrival order within the store.
    pub seq: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("partition error: {0}")]
    Partition(String),
    #[error("partition timed out after {0:?}")]
    Timeout(Duration),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type ReadingStream =
    Pin<Box<dyn Stream<Item = Result<Envelope<RawReading>, PipelineError>> + Send>>;

/// Read side of the raw reading store.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// Devices with at least one reading in `[start, end]`.
    async fn device_ids(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, PipelineError>;

    /// The readings of one device in `[start, end]`, unvalidated.
    async fn scan(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ReadingStream, PipelineError>;

    async fn device_metadata(&self) -> Result<Vec<DeviceMetadata>, PipelineError>;

    /// Rows in the range the store could not attribute to any device.
    async fn orphaned_rows(
        &self,
        _start: OffsetDateTime,
        _end: OffsetDateTime,
    ) -> Result<u64, PipelineError> {
        Ok(0)
    }
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

/// The device tables of one run, handed to [`Sink::commit`] once every
/// partition has finished.
#[derive(Debug, Clone, Copy)]
pub struct RunTables<'a> {
    pub as_of: OffsetDateTime,
    /// Devices recomputed in this run, sorted by id.
    pub recomputed: &'a [DeviceTables],
    /// Devices listed for this run whose recompute failed. Their previously
    /// published rows must survive the commit.
    pub failed: &'a [String],
}

/// Destination of recomputed tables.
///
/// `publish` is called per device as partitions finish and replaces all of
/// that device's rows at once, never leaving a mix of old and new tables.
/// `commit` runs once per run and drops output of devices the run no longer
/// lists. A sink may also defer all writing to `commit`.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, tables: &DeviceTables) -> Result<(), PipelineError>;

    async fn commit(&self, _run: &RunTables<'_>) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn publish_views(&self, _views: &Views) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Recomputed {
        readings: usize,
        rejected: u64,
        hourly_rows: usize,
        daily_rows: usize,
        feature_rows: usize,
        anomalies: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    #[serde(flatten)]
    pub outcome: DeviceOutcome,
}

impl DeviceReport {
    fn recomputed(t: &DeviceTables) -> Self {
        Self {
            device_id: t.device_id.clone(),
            outcome: DeviceOutcome::Recomputed {
                readings: t.reading_count,
                rejected: t.rejected,
                hourly_rows: t.hourly.len(),
                daily_rows: t.daily.len(),
                feature_rows: t.features.len(),
                anomalies: t.anomalies.len(),
            },
        }
    }

    fn failed(device_id: String, err: &PipelineError) -> Self {
        Self {
            device_id,
            outcome: DeviceOutcome::Failed {
                error: err.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, DeviceOutcome::Recomputed { .. })
    }
}

/// Outcome of one recompute across all devices.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    /// Sorted by device id.
    pub devices: Vec<DeviceReport>,
    #[serde(skip)]
    pub tables: Vec<DeviceTables>,
    #[serde(skip)]
    pub views: Views,
    pub orphaned_rows: u64,
    pub views_error: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.devices.iter().filter(|d| d.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.devices.len() - self.succeeded()
    }

    /// Readings dropped by validation plus rows no device could claim.
    pub fn rejected_total(&self) -> u64 {
        let per_device: u64 = self
            .devices
            .iter()
            .map(|d| match d.outcome {
                DeviceOutcome::Recomputed { rejected, .. } => rejected,
                DeviceOutcome::Failed { .. } => 0,
            })
            .sum();
        per_device + self.orphaned_rows
    }
}

/// Recomputes every device partition of the trailing horizon from the raw
/// store and republishes the results.
pub struct RecomputeJob<S, K> {
    pub store: S,
    pub validation: Arc<dyn Transform<RawReading, Reading> + Send + Sync>,
    pub sink: K,
    pub config: Arc<AnalyticsConfig>,
}

impl<S, K> RecomputeJob<S, K>
where
    S: ReadingStore,
    K: Sink,
{
    pub fn new(store: S, sink: K, config: AnalyticsConfig) -> Self {
        Self {
            store,
            validation: Arc::new(ReadingValidation),
            sink,
            config: Arc::new(config),
        }
    }

    /// Run one full recompute as of `as_of`.
    ///
    /// A device that fails is reported and skipped; the run itself only fails
    /// when the store cannot list devices at all.
    pub async fn run(&self, as_of: OffsetDateTime) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let start = as_of - time::Duration::days(self.config.horizon_days);

        let device_ids = self.store.device_ids(start, as_of).await?;
        let devices = self.store.device_metadata().await?;
        let orphaned = self.store.orphaned_rows(start, as_of).await?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "readings without a device id were skipped");
            metrics::counter!("readings_orphaned_total").increment(orphaned);
        }

        tracing::info!(
            devices = device_ids.len(),
            %as_of,
            horizon_days = self.config.horizon_days,
            "starting recompute"
        );

        let outcomes: Vec<(String, Result<DeviceTables, PipelineError>)> =
            stream::iter(device_ids)
                .map(|device_id| async move {
                    let res = self.recompute_device(&device_id, start, as_of).await;
                    (device_id, res)
                })
                .buffer_unordered(self.config.workers.max(1))
                .collect()
                .await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut tables = Vec::with_capacity(outcomes.len());
        for (device_id, res) in outcomes {
            match res {
                Ok(t) => {
                    reports.push(DeviceReport::recomputed(&t));
                    tables.push(t);
                }
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "device recompute failed");
                    metrics::counter!("partitions_failed_total").increment(1);
                    reports.push(DeviceReport::failed(device_id, &e));
                }
            }
        }
        reports.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        tables.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let failed: Vec<String> = reports
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.device_id.clone())
            .collect();
        let committed = self
            .sink
            .commit(&RunTables {
                as_of,
                recomputed: &tables,
                failed: &failed,
            })
            .await;

        let (views, views_error) = match committed {
            Ok(()) => {
                let views = Views::build(&tables, &devices, as_of, &self.config);
                let views_error = match self.sink.publish_views(&views).await {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::error!(error = %e, "publishing views failed");
                        Some(e.to_string())
                    }
                };
                (views, views_error)
            }
            Err(e) => {
                // Nothing from this run became visible, so neither do its views.
                tracing::error!(error = %e, "committing device tables failed");
                metrics::counter!("partitions_failed_total").increment(tables.len() as u64);
                for report in reports.iter_mut().filter(|r| r.is_ok()) {
                    *report = DeviceReport::failed(report.device_id.clone(), &e);
                }
                tables.clear();
                let views = Views::build(&tables, &devices, as_of, &self.config);
                (views, Some(format!("views not published: {e}")))
            }
        };

        let report = RunReport {
            as_of,
            devices: reports,
            tables,
            views,
            orphaned_rows: orphaned,
            views_error,
        };

        metrics::histogram!("recompute_run_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            rejected = report.rejected_total(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recompute finished"
        );

        Ok(report)
    }

    async fn recompute_device(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        as_of: OffsetDateTime,
    ) -> Result<DeviceTables, PipelineError> {
        let started = Instant::now();

        // Panics anywhere in the store, validation or computation fail only this device.
        let work = AssertUnwindSafe(self.compute_device(device_id, start, as_of)).catch_unwind();
        let computed = match self.config.partition_timeout_secs.map(Duration::from_secs) {
            Some(budget) => tokio::time::timeout(budget, work)
                .await
                .map_err(|_| PipelineError::Timeout(budget))?,
            None => work.await,
        };
        let tables = computed.map_err(|panic| {
            PipelineError::Partition(format!("recompute panicked: {}", panic_message(&*panic)))
        })??;

        // Publishing stays outside the budget so a device is never cut off mid-write.
        self.sink.publish(&tables).await?;

        metrics::counter!("partitions_recomputed_total").increment(1);
        metrics::counter!("anomalies_detected_total").increment(tables.anomalies.len() as u64);
        metrics::histogram!("partition_recompute_seconds").record(started.elapsed().as_secs_f64());
        tracing::debug!(
            device_id,
            readings = tables.reading_count,
            rejected = tables.rejected,
            anomalies = tables.anomalies.len(),
            "device recomputed"
        );

        Ok(tables)
    }

    async fn compute_device(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        as_of: OffsetDateTime,
    ) -> Result<DeviceTables, PipelineError> {
        let mut input = self.store.scan(device_id, start, as_of).await?;
        let mut readings = Vec::new();
        let mut rejected: u64 = 0;
        while let Some(item) = input.next().await {
            match self.validation.apply(item?).await {
                Ok(env) if env.payload.device_id == device_id => readings.push(env.payload),
                Ok(env) => {
                    rejected += 1;
                    tracing::warn!(
                        device_id,
                        found = %env.payload.device_id,
                        "reading returned for the wrong device"
                    );
                }
                Err(e) => {
                    rejected += 1;
                    tracing::debug!(device_id, error = %e, "reading rejected");
                }
            }
        }

        let cfg = Arc::clone(&self.config);
        let id = device_id.to_string();
        tokio::task::spawn_blocking(move || compute_partition(id, readings, rejected, &cfg, as_of))
            .await
            .map_err(|e| PipelineError::Partition(format!("recompute task failed: {e}")))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
