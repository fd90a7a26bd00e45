use anyhow::{anyhow, bail, Result};
use analytics_service::{
    config::{AnalyticsConfig, AppConfig},
    observability,
    pipeline::RecomputeJob,
    sinks::NdjsonDirSink,
    sources::{load_csv, load_devices_ndjson, load_ndjson},
};
use std::{env, path::Path};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: recompute_file <readings.ndjson|readings.csv> <output_dir> [as_of_rfc3339] [devices.ndjson]");
    }
    let input = Path::new(&args[1]);
    let output_dir = &args[2];

    // The [analytics] section of ANALYTICS_CONFIG applies when set.
    let analytics = if env::var_os("ANALYTICS_CONFIG").is_some() {
        AppConfig::load()?.analytics
    } else {
        AnalyticsConfig::default()
    };

    let is_csv = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    let mut store = if is_csv {
        load_csv(input).await?
    } else {
        load_ndjson(input).await?
    };
    if let Some(devices_path) = args.get(4) {
        store = store.with_devices(load_devices_ndjson(devices_path).await?);
    }

    // Defaulting to the newest reading keeps reruns over the same file identical.
    let as_of = match args.get(3) {
        Some(s) => OffsetDateTime::parse(s, &Rfc3339).map_err(|e| anyhow!("invalid as_of '{s}': {e}"))?,
        None => store
            .latest_ts()
            .ok_or_else(|| anyhow!("{} contains no timestamped readings", input.display()))?,
    };

    let job = RecomputeJob::new(store, NdjsonDirSink::new(output_dir), analytics);
    let report = job.run(as_of).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed() > 0 {
        bail!("{} of {} devices failed to recompute", report.failed(), report.devices.len());
    }
    Ok(())
}
