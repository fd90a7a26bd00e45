use analytics_service::{
    config::{AppConfig, SinkKind, StoreKind},
    metrics_server, observability,
    pipeline::{
        DeviceTables, PipelineError, ReadingStore, ReadingStream, RecomputeJob, RunReport, RunTables,
        Sink,
    },
    sinks::{NdjsonDirSink, QuestDbTableSink},
    sources::{load_csv, load_devices_ndjson, load_ndjson, InMemoryReadingStore, QuestDbReadingStore},
    views::Views,
};
use anyhow::{anyhow, Result};
use ecogrid_client::domain::DeviceMetadata;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use time::OffsetDateTime;

enum Store {
    Pgwire(QuestDbReadingStore),
    File(InMemoryReadingStore),
}

#[async_trait::async_trait]
impl ReadingStore for Store {
    async fn device_ids(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<String>, PipelineError> {
        match self {
            Self::Pgwire(s) => s.device_ids(start, end).await,
            Self::File(s) => s.device_ids(start, end).await,
        }
    }

    async fn scan(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<ReadingStream, PipelineError> {
        match self {
            Self::Pgwire(s) => s.scan(device_id, start, end).await,
            Self::File(s) => s.scan(device_id, start, end).await,
        }
    }

    async fn device_metadata(&self) -> Result<Vec<DeviceMetadata>, PipelineError> {
        match self {
            Self::Pgwire(s) => s.device_metadata().await,
            Self::File(s) => s.device_metadata().await,
        }
    }

    async fn orphaned_rows(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<u64, PipelineError> {
        match self {
            Self::Pgwire(s) => s.orphaned_rows(start, end).await,
            Self::File(s) => s.orphaned_rows(start, end).await,
        }
    }
}

enum TableSink {
    Pgwire(QuestDbTableSink),
    Ndjson(NdjsonDirSink),
}

#[async_trait::async_trait]
impl Sink for TableSink {
    async fn publish(&self, tables: &DeviceTables) -> Result<(), PipelineError> {
        match self {
            Self::Pgwire(s) => s.publish(tables).await,
            Self::Ndjson(s) => s.publish(tables).await,
        }
    }

    async fn commit(&self, run: &RunTables<'_>) -> Result<(), PipelineError> {
        match self {
            Self::Pgwire(s) => s.commit(run).await,
            Self::Ndjson(s) => s.commit(run).await,
        }
    }

    async fn publish_views(&self, views: &Views) -> Result<(), PipelineError> {
        match self {
            Self::Pgwire(s) => s.publish_views(views).await,
            Self::Ndjson(s) => s.publish_views(views).await,
        }
    }
}

async fn build_store(cfg: &AppConfig, pool: Option<&PgPool>) -> Result<Store> {
    let store = match cfg.store.kind {
        StoreKind::Pgwire => {
            let pool = pool.ok_or_else(|| anyhow!("pgwire store needs a questdb pool"))?;
            Store::Pgwire(QuestDbReadingStore::new(pool.clone()))
        }
        StoreKind::Ndjson | StoreKind::Csv => {
            let path = cfg
                .store
                .path
                .clone()
                .ok_or_else(|| anyhow!("store.path is required for file stores"))?;
            let readings = if cfg.store.kind == StoreKind::Csv {
                load_csv(path).await?
            } else {
                load_ndjson(path).await?
            };
            let devices = match &cfg.store.devices_path {
                Some(p) => load_devices_ndjson(p.clone()).await?,
                None => Vec::new(),
            };
            Store::File(readings.with_devices(devices))
        }
    };
    Ok(store)
}

fn build_sink(cfg: &AppConfig, pool: Option<&PgPool>) -> Result<TableSink> {
    let sink_cfg = &cfg.sink;
    let sink = match sink_cfg.kind {
        SinkKind::Pgwire => {
            let pool = pool.ok_or_else(|| anyhow!("pgwire sink needs a questdb pool"))?;
            TableSink::Pgwire(QuestDbTableSink::new(
                pool.clone(),
                sink_cfg.batch_size,
                sink_cfg.max_retries,
                Duration::from_millis(sink_cfg.retry_backoff_ms),
            ))
        }
        SinkKind::Ndjson => {
            let dir = sink_cfg
                .output_dir
                .clone()
                .ok_or_else(|| anyhow!("sink.output_dir is required for the ndjson sink"))?;
            TableSink::Ndjson(NdjsonDirSink::new(dir))
        }
    };
    Ok(sink)
}

/// One recompute as of now. File stores are reloaded so each run sees the
/// current export.
async fn run_once(cfg: &AppConfig, pool: Option<&PgPool>) -> Result<RunReport> {
    let store = build_store(cfg, pool).await?;
    let sink = build_sink(cfg, pool)?;
    let job = RecomputeJob::new(store, sink, cfg.analytics.clone());

    let report = job.run(OffsetDateTime::now_utc()).await?;
    metrics_server::record_run(&report);
    for failed in report.devices.iter().filter(|d| !d.is_ok()) {
        tracing::warn!(device_id = %failed.device_id, "device left at previous state");
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let needs_pgwire = cfg.store.kind == StoreKind::Pgwire || cfg.sink.kind == SinkKind::Pgwire;

    // Create QuestDB connection pool only if the store or sink uses pgwire.
    let pool = match (&cfg.questdb, needs_pgwire) {
        (Some(q), true) => Some(
            PgPoolOptions::new()
                .max_connections(q.max_connections)
                .connect(&q.uri)
                .await?,
        ),
        _ => None,
    };

    match &cfg.schedule {
        None => {
            let report = run_once(&cfg, pool.as_ref()).await?;
            if report.failed() > 0 {
                anyhow::bail!("{} of {} devices failed to recompute", report.failed(), report.devices.len());
            }
        }
        Some(schedule) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(schedule.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = run_once(&cfg, pool.as_ref()).await {
                    tracing::error!(error = %e, "scheduled recompute failed");
                }
            }
        }
    }

    Ok(())
}
