use crate::pipeline::{Envelope, PipelineError, Transform};
use ecogrid_client::domain::{RawReading, Reading};
use time::{macros::datetime, UtcOffset};

/// Pure validation of a raw reading.
///
/// Rules:
/// - device_id must be present and not blank; surrounding whitespace is dropped.
/// - ts must be present and within a broad sanity window [2000-01-01, 2100-01-01].
/// - numeric fields, when present, must be finite.
///
/// Accepted timestamps are normalized to UTC.
pub fn validate_reading(env: Envelope<RawReading>) -> Result<Envelope<Reading>, PipelineError> {
    let Envelope { payload: raw, seq } = env;

    let device_id = match raw.device_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(PipelineError::Validation("device_id is missing".to_string())),
    };

    let ts = raw
        .ts
        .ok_or_else(|| PipelineError::Validation("timestamp is missing".to_string()))?;

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if ts < min_ts || ts > max_ts {
        return Err(PipelineError::Validation("timestamp out of allowed range".to_string()));
    }

    for (field, value) in [
        ("power_w", raw.power_w),
        ("energy_wh", raw.energy_wh),
        ("voltage", raw.voltage),
        ("temp_c", raw.temp_c),
    ] {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(PipelineError::Validation(format!("{field} must be finite")));
        }
    }

    Ok(Envelope {
        payload: Reading {
            ts: ts.to_offset(UtcOffset::UTC),
            device_id,
            power_w: raw.power_w,
            energy_wh: raw.energy_wh,
            voltage: raw.voltage,
            temp_c: raw.temp_c,
            occupancy: raw.occupancy,
            ingest_seq: seq,
        },
        seq,
    })
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<RawReading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<RawReading>) -> Result<Envelope<Reading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("readings_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}
