use std::{future::Future, time::Duration};

use ecogrid_client::domain::{Anomaly, DailyAggregate, FeatureRow, HourlyAggregate, Reading};
use sqlx::{postgres::PgPool, PgConnection, Postgres, QueryBuilder};

use crate::{
    pipeline::{DeviceTables, PipelineError, RunTables, Sink},
    views::{DeviceSummary, RealtimeAnomaly, Views},
};

pub const HOURLY_TABLE: &str = "analytics_hourly";
pub const DAILY_TABLE: &str = "analytics_daily";
pub const FEATURES_TABLE: &str = "ml_features";
pub const ANOMALIES_TABLE: &str = "anomalies";

const DEVICE_TABLES: [&str; 4] = [HOURLY_TABLE, DAILY_TABLE, FEATURES_TABLE, ANOMALIES_TABLE];

/// Writes recomputed tables over pgwire.
///
/// QuestDB has no row-level DELETE, so device tables are replaced whole when
/// the run commits. Each table is rebuilt as `<table>_next`, seeded with the
/// rows of devices that failed this run and filled with every recomputed
/// device, then renamed over the live table. Devices the run no longer lists
/// are not carried over. View tables are truncated and refilled.
pub struct QuestDbTableSink {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

fn staging_table(table: &str) -> String {
    format!("{table}_next")
}

/// Filter selecting the rows of `device_ids`, matching nothing when empty.
fn device_filter(device_ids: &[String]) -> String {
    if device_ids.is_empty() {
        return "1 = 0".to_string();
    }
    let quoted: Vec<String> = device_ids
        .iter()
        .map(|id| format!("'{}'", id.replace('\'', "''")))
        .collect();
    format!("device_id IN ({})", quoted.join(", "))
}

impl QuestDbTableSink {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn with_retry<F, Fut>(&self, what: &str, op: F) -> Result<(), PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        what,
                        "questdb sink write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, what, "questdb sink write failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(PipelineError::Sink(format!("{what}: {e}")));
                }
            }
        }
    }

    /// Build `<table>_next` from the failed devices' live rows plus this run's rows.
    async fn stage(&self, table: &'static str, run: &RunTables<'_>) -> Result<(), sqlx::Error> {
        let next = staging_table(table);
        let mut conn = self.pool.acquire().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {next}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE {next} AS (SELECT * FROM {table} WHERE {})",
            device_filter(run.failed)
        ))
        .execute(&mut *conn)
        .await?;

        let mut written = 0usize;
        for t in run.recomputed {
            written += match table {
                HOURLY_TABLE => self.insert_chunked(&mut *conn, &next, &t.hourly, insert_hourly).await?,
                DAILY_TABLE => self.insert_chunked(&mut *conn, &next, &t.daily, insert_daily).await?,
                FEATURES_TABLE => self.insert_chunked(&mut *conn, &next, &t.features, insert_features).await?,
                _ => self.insert_chunked(&mut *conn, &next, &t.anomalies, insert_anomalies).await?,
            };
        }
        metrics::counter!("questdb_rows_written_total", "table" => table).increment(written as u64);
        Ok(())
    }

    async fn insert_chunked<T, F>(
        &self,
        conn: &mut PgConnection,
        into: &str,
        rows: &[T],
        insert: F,
    ) -> Result<usize, sqlx::Error>
    where
        F: for<'c> Fn(&'c mut PgConnection, &'c str, &'c [T]) -> BoxInsert<'c>,
    {
        for chunk in rows.chunks(self.batch_size) {
            insert(&mut *conn, into, chunk).await?;
        }
        Ok(rows.len())
    }

    async fn swap(&self, table: &'static str) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&format!("RENAME TABLE {} TO {table}", staging_table(table)))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn replace_views(&self, v: &Views) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for table in ["current_usage", "device_summary", "realtime_anomalies", "training_data"] {
            sqlx::query(&format!("TRUNCATE TABLE {table}"))
                .execute(&mut *tx)
                .await?;
        }
        for chunk in v.current_usage.chunks(self.batch_size) {
            insert_current_usage(&mut *tx, chunk).await?;
        }
        for chunk in v.device_summary.chunks(self.batch_size) {
            insert_device_summary(&mut *tx, chunk).await?;
        }
        for chunk in v.realtime_anomalies.chunks(self.batch_size) {
            insert_realtime_anomalies(&mut *tx, chunk).await?;
        }
        for chunk in v.training_data.chunks(self.batch_size) {
            insert_features(&mut *tx, "training_data", chunk).await?;
        }

        tx.commit().await
    }
}

type BoxInsert<'c> = futures::future::BoxFuture<'c, Result<(), sqlx::Error>>;

fn insert_hourly<'c>(conn: &'c mut PgConnection, into: &'c str, rows: &'c [HourlyAggregate]) -> BoxInsert<'c> {
    Box::pin(async move {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {into} (device_id, hour_ts, reading_count, avg_power_w, max_power_w, min_power_w, \
             total_energy_wh, high_power_events, avg_voltage, avg_temp_c, occupancy_rate, anomaly_count, \
             rolling_avg_24, rolling_std_24, power_lag_1, power_lag_24, z_score, is_anomaly, severity) "
        ));
        builder.push_values(rows, |mut b, h| {
            b.push_bind(&h.device_id)
                .push_bind(h.hour_ts)
                .push_bind(i64::from(h.reading_count))
                .push_bind(h.avg_power_w)
                .push_bind(h.max_power_w)
                .push_bind(h.min_power_w)
                .push_bind(h.total_energy_wh)
                .push_bind(i64::from(h.high_power_events))
                .push_bind(h.avg_voltage)
                .push_bind(h.avg_temp_c)
                .push_bind(h.occupancy_rate)
                .push_bind(i64::from(h.anomaly_count))
                .push_bind(h.rolling_avg_24)
                .push_bind(h.rolling_std_24)
                .push_bind(h.power_lag_1)
                .push_bind(h.power_lag_24)
                .push_bind(h.z_score)
                .push_bind(h.is_anomaly)
                .push_bind(h.severity.as_str());
        });
        builder.build().execute(conn).await.map(|_| ())
    })
}

fn insert_daily<'c>(conn: &'c mut PgConnection, into: &'c str, rows: &'c [DailyAggregate]) -> BoxInsert<'c> {
    Box::pin(async move {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {into} (device_id, date, hour_count, total_energy_wh, avg_power_w, peak_power_w, \
             peak_hour, low_power_hours, anomaly_count, cost_usd, carbon_kg) "
        ));
        builder.push_values(rows, |mut b, d| {
            b.push_bind(&d.device_id)
                .push_bind(d.date)
                .push_bind(i64::from(d.hour_count))
                .push_bind(d.total_energy_wh)
                .push_bind(d.avg_power_w)
                .push_bind(d.peak_power_w)
                .push_bind(d.peak_hour.map(i16::from))
                .push_bind(i64::from(d.low_power_hours))
                .push_bind(i64::from(d.anomaly_count))
                .push_bind(d.cost_usd)
                .push_bind(d.carbon_kg);
        });
        builder.build().execute(conn).await.map(|_| ())
    })
}

fn insert_features<'c>(conn: &'c mut PgConnection, into: &'c str, rows: &'c [FeatureRow]) -> BoxInsert<'c> {
    Box::pin(async move {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {into} (device_id, ts, power_w, energy_wh, hour_of_day, day_of_week, month, is_weekend, \
             is_holiday, lag_1, lag_12, lag_24, rolling_avg_1h, rolling_std_1h, rolling_avg_24, rolling_std_24, \
             energy_delta_1, energy_delta_12, energy_delta_24, anomaly_score, is_anomaly) "
        ));
        builder.push_values(rows, |mut b, f| {
            b.push_bind(&f.device_id)
                .push_bind(f.ts)
                .push_bind(f.power_w)
                .push_bind(f.energy_wh)
                .push_bind(i16::from(f.hour_of_day))
                .push_bind(i16::from(f.day_of_week))
                .push_bind(i16::from(f.month))
                .push_bind(f.is_weekend)
                .push_bind(f.is_holiday)
                .push_bind(f.lag_1)
                .push_bind(f.lag_12)
                .push_bind(f.lag_24)
                .push_bind(f.rolling_avg_1h)
                .push_bind(f.rolling_std_1h)
                .push_bind(f.rolling_avg_24)
                .push_bind(f.rolling_std_24)
                .push_bind(f.energy_delta_1)
                .push_bind(f.energy_delta_12)
                .push_bind(f.energy_delta_24)
                .push_bind(f.anomaly_score)
                .push_bind(f.is_anomaly);
        });
        builder.build().execute(conn).await.map(|_| ())
    })
}

fn insert_anomalies<'c>(conn: &'c mut PgConnection, into: &'c str, rows: &'c [Anomaly]) -> BoxInsert<'c> {
    Box::pin(async move {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {into} (anomaly_id, device_id, ts, kind, severity, original_value, observed_value, \
             z_score, confidence, explanation) "
        ));
        builder.push_values(rows, |mut b, a| {
            b.push_bind(&a.anomaly_id)
                .push_bind(&a.device_id)
                .push_bind(a.ts)
                .push_bind(a.kind.as_str())
                .push_bind(a.severity.as_str())
                .push_bind(a.original_value)
                .push_bind(a.observed_value)
                .push_bind(a.z_score)
                .push_bind(a.confidence)
                .push_bind(&a.explanation);
        });
        builder.build().execute(conn).await.map(|_| ())
    })
}

async fn insert_current_usage(conn: &mut PgConnection, rows: &[Reading]) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO current_usage (device_id, ts, power_w, energy_wh, voltage, temp_c, occupancy) ",
    );
    builder.push_values(rows, |mut b, r| {
        b.push_bind(&r.device_id)
            .push_bind(r.ts)
            .push_bind(r.power_w)
            .push_bind(r.energy_wh)
            .push_bind(r.voltage)
            .push_bind(r.temp_c)
            .push_bind(r.occupancy);
    });
    builder.build().execute(conn).await.map(|_| ())
}

async fn insert_device_summary(conn: &mut PgConnection, rows: &[DeviceSummary]) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO device_summary (device_id, device_name, device_type, location, capacity_w, status, \
         current_power_w, current_energy_wh, last_reading_ts, last_hour_ts, last_hour_avg_power_w, \
         last_hour_anomaly_count) ",
    );
    builder.push_values(rows, |mut b, s| {
        b.push_bind(&s.device_id)
            .push_bind(&s.device_name)
            .push_bind(&s.device_type)
            .push_bind(&s.location)
            .push_bind(s.capacity_w)
            .push_bind(&s.status)
            .push_bind(s.current_power_w)
            .push_bind(s.current_energy_wh)
            .push_bind(s.last_reading_ts)
            .push_bind(s.last_hour_ts)
            .push_bind(s.last_hour_avg_power_w)
            .push_bind(s.last_hour_anomaly_count.map(i64::from));
    });
    builder.build().execute(conn).await.map(|_| ())
}

async fn insert_realtime_anomalies(
    conn: &mut PgConnection,
    rows: &[RealtimeAnomaly],
) -> Result<(), sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO realtime_anomalies (device_id, ts, power_w, rolling_avg_24, anomaly_score, severity, \
         confidence, is_anomaly) ",
    );
    builder.push_values(rows, |mut b, a| {
        b.push_bind(&a.device_id)
            .push_bind(a.ts)
            .push_bind(a.power_w)
            .push_bind(a.rolling_avg_24)
            .push_bind(a.anomaly_score)
            .push_bind(a.severity.as_str())
            .push_bind(a.confidence)
            .push_bind(a.is_anomaly);
    });
    builder.build().execute(conn).await.map(|_| ())
}

#[async_trait::async_trait]
impl Sink for QuestDbTableSink {
    async fn publish(&self, tables: &DeviceTables) -> Result<(), PipelineError> {
        // Rows are written when the run commits.
        tracing::debug!(device_id = %tables.device_id, "device tables staged for commit");
        Ok(())
    }

    async fn commit(&self, run: &RunTables<'_>) -> Result<(), PipelineError> {
        for table in DEVICE_TABLES {
            self.with_retry(&format!("stage {table}"), || self.stage(table, run))
                .await?;
        }
        // Live tables change only once every staging table is complete.
        for table in DEVICE_TABLES {
            self.with_retry(&format!("swap {table}"), || self.swap(table)).await?;
        }
        tracing::info!(
            as_of = %run.as_of,
            devices = run.recomputed.len(),
            carried_over = run.failed.len(),
            "device tables replaced"
        );
        Ok(())
    }

    async fn publish_views(&self, views: &Views) -> Result<(), PipelineError> {
        self.with_retry("replace views", || self.replace_views(views)).await
    }
}
