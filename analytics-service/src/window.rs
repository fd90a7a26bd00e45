//! Trailing-window statistics over one device's ordered series.
//!
//! Positions are row offsets: hourly buckets that exist, or raw readings. A
//! window at position `i` covers `[i + 1 - w, i]`, clipped at the start of the
//! series, and skips null values inside it.

use serde::Deserialize;

/// Which standard deviation the rolling windows report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispersion {
    /// Bessel-corrected; null for a single value.
    #[default]
    Sample,
    Population,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RollingStats {
    pub avg: Option<f64>,
    pub std: Option<f64>,
    /// Non-null values that fell inside the window.
    pub count: usize,
}

/// Rolling average and standard deviation at every position of `values`.
pub fn rolling(values: &[Option<f64>], window: usize, dispersion: Dispersion) -> Vec<RollingStats> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            stats_of(values[start..=i].iter().flatten().copied(), dispersion)
        })
        .collect()
}

/// Average and spread of a plain slice of values.
pub fn stats(values: &[f64], dispersion: Dispersion) -> RollingStats {
    stats_of(values.iter().copied(), dispersion)
}

fn stats_of(window: impl Iterator<Item = f64> + Clone, dispersion: Dispersion) -> RollingStats {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in window.clone() {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }

    if count == 0 {
        return RollingStats::default();
    }

    // A flat window must report exactly zero spread; the two-pass sum below can
    // leave rounding residue when the mean is not representable.
    if min == max {
        let std = match dispersion {
            Dispersion::Sample if count < 2 => None,
            _ => Some(0.0),
        };
        return RollingStats { avg: Some(min), std, count };
    }

    let avg = sum / count as f64;
    let sq: f64 = window.map(|v| (v - avg) * (v - avg)).sum();
    let denom = match dispersion {
        Dispersion::Sample => count - 1,
        Dispersion::Population => count,
    };

    RollingStats {
        avg: Some(avg),
        std: Some((sq / denom as f64).sqrt()),
        count,
    }
}

/// The value exactly `k` positions earlier, null for the first `k` positions.
pub fn lag(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| if i >= k { values[i - k] } else { None })
        .collect()
}

/// `value - lag(k)`, null unless both sides are present.
pub fn delta(values: &[Option<f64>], k: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .zip(lag(values, k))
        .map(|(cur, prev)| Some((*cur)? - prev?))
        .collect()
}
