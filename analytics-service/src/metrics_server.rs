use std::{net::SocketAddr, sync::RwLock};

use axum::{http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use serde::Serialize;

use crate::pipeline::RunReport;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static LAST_RUN: Lazy<RwLock<Option<RunHealth>>> = Lazy::new(|| RwLock::new(None));

#[derive(Debug, Clone, Serialize)]
pub struct RunHealth {
    pub as_of: String,
    pub devices_ok: usize,
    pub devices_failed: usize,
    pub readings_rejected: u64,
}

impl From<&RunReport> for RunHealth {
    fn from(report: &RunReport) -> Self {
        Self {
            as_of: report.as_of.to_string(),
            devices_ok: report.succeeded(),
            devices_failed: report.failed(),
            readings_rejected: report.rejected_total(),
        }
    }
}

/// Install the Prometheus recorder and serve `/metrics` and `/healthz`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address: {e}"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))?;

    // Ignore error if the handle was already set; this should only be called once.
    let _ = PROM_HANDLE.set(handle);

    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

/// Remember the outcome of the latest recompute for `/healthz`.
pub fn record_run(report: &RunReport) {
    if let Ok(mut last) = LAST_RUN.write() {
        *last = Some(RunHealth::from(report));
    }
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

async fn health_handler() -> Result<Json<RunHealth>, StatusCode> {
    let last = LAST_RUN
        .read()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    match last {
        Some(run) if run.devices_failed == 0 => Ok(Json(run)),
        Some(_) | None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}
