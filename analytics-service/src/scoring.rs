//! Z-score anomaly scoring and severity tiers.
//!
//! The scorer is stateless: it only reads the window statistics produced by
//! [`crate::window`].

use ecogrid_client::domain::{Anomaly, AnomalyKind, Severity};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::window::RollingStats;

/// `|value - avg| / std`, or 0 when the window has no spread or any input is null.
pub fn z_score(value: Option<f64>, stats: &RollingStats) -> f64 {
    match (value, stats.avg, stats.std) {
        (Some(v), Some(avg), Some(std)) if std > 0.0 => (v - avg).abs() / std,
        _ => 0.0,
    }
}

/// Confidence attached to an anomaly: strictly increasing in `z`, within (0, 1)
/// for any positive score.
pub fn confidence(z: f64) -> f64 {
    if z.is_finite() && z > 0.0 {
        z / (1.0 + z)
    } else if z == f64::INFINITY {
        1.0
    } else {
        0.0
    }
}

/// Lower bounds (exclusive) of each surfaced severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SeverityLadder {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for SeverityLadder {
    fn default() -> Self {
        Self {
            high: 3.0,
            medium: 2.0,
            low: 1.5,
        }
    }
}

impl SeverityLadder {
    pub fn classify(&self, z: f64) -> Severity {
        if z > self.high {
            Severity::High
        } else if z > self.medium {
            Severity::Medium
        } else if z > self.low {
            Severity::Low
        } else {
            Severity::Normal
        }
    }

    pub fn is_well_ordered(&self) -> bool {
        self.low >= 0.0 && self.low < self.medium && self.medium < self.high
    }
}

/// Deterministic id of an anomaly observation.
pub fn anomaly_id(device_id: &str, ts: OffsetDateTime, kind: AnomalyKind) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&(device_id.len() as u32).to_le_bytes());
    h.update(device_id.as_bytes());
    h.update(&ts.unix_timestamp_nanos().to_le_bytes());
    h.update(kind.as_str().as_bytes());
    h.finalize().to_hex().to_string()
}

/// Human-readable account of why an observation was flagged.
pub fn explanation(
    kind: AnomalyKind,
    ts: OffsetDateTime,
    observed: f64,
    expected: Option<f64>,
    z: f64,
) -> String {
    match kind {
        AnomalyKind::HourlyZscore => format!(
            "Hourly average power of {observed:.1} W is {z:.1} standard deviations from the trailing hourly average"
        ),
        AnomalyKind::ReadingZscore => {
            format!("Power consumption {z:.1} standard deviations from the trailing average")
        }
        AnomalyKind::Trend => {
            let deviation = expected.map_or(0.0, |e| (observed - e).abs());
            format!("Sudden deviation from trend: {deviation:.1} W difference")
        }
        AnomalyKind::Seasonal => format!(
            "Unusual consumption for {:02}:00, {z:.1} standard deviations from normal",
            ts.hour()
        ),
    }
}

/// Build the anomaly record for one flagged observation. `expected` is the
/// baseline the observation was scored against.
pub fn anomaly(
    device_id: &str,
    ts: OffsetDateTime,
    kind: AnomalyKind,
    observed: f64,
    expected: Option<f64>,
    z: f64,
    severity: Severity,
) -> Anomaly {
    Anomaly {
        anomaly_id: anomaly_id(device_id, ts, kind),
        device_id: device_id.to_string(),
        ts,
        kind,
        severity,
        original_value: expected,
        observed_value: observed,
        z_score: z,
        confidence: confidence(z),
        explanation: explanation(kind, ts, observed, expected, z),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn stats(avg: f64, std: f64) -> RollingStats {
        RollingStats {
            avg: Some(avg),
            std: Some(std),
            count: 24,
        }
    }

    #[test]
    fn zero_spread_scores_zero() {
        assert_eq!(z_score(Some(500.0), &stats(100.0, 0.0)), 0.0);
        assert_eq!(z_score(Some(500.0), &RollingStats::default()), 0.0);
        assert_eq!(z_score(None, &stats(100.0, 10.0)), 0.0);
    }

    #[test]
    fn z_score_is_absolute() {
        assert_eq!(z_score(Some(70.0), &stats(100.0, 10.0)), 3.0);
        assert_eq!(z_score(Some(130.0), &stats(100.0, 10.0)), 3.0);
    }

    #[test]
    fn ladder_boundaries_fall_in_the_lower_tier() {
        let ladder = SeverityLadder::default();
        assert_eq!(ladder.classify(0.0), Severity::Normal);
        assert_eq!(ladder.classify(1.5), Severity::Normal);
        assert_eq!(ladder.classify(1.500_001), Severity::Low);
        assert_eq!(ladder.classify(2.0), Severity::Low);
        assert_eq!(ladder.classify(2.5), Severity::Medium);
        assert_eq!(ladder.classify(3.0), Severity::Medium);
        assert_eq!(ladder.classify(3.01), Severity::High);
        assert_eq!(ladder.classify(f64::INFINITY), Severity::High);
    }

    #[test]
    fn severity_never_decreases_as_z_grows() {
        let ladder = SeverityLadder::default();
        let mut prev = Severity::Normal;
        for step in 0..1000 {
            let tier = ladder.classify(step as f64 * 0.01);
            assert!(tier >= prev);
            prev = tier;
        }
        assert_eq!(prev, Severity::High);
    }

    #[test]
    fn confidence_is_strictly_increasing_and_bounded() {
        let mut prev = 0.0;
        for step in 1..200 {
            let c = confidence(step as f64 * 0.25);
            assert!(c > prev);
            assert!(c > 0.0 && c <= 1.0);
            prev = c;
        }
        assert_eq!(confidence(f64::INFINITY), 1.0);
    }

    #[test]
    fn ladder_ordering_is_checked() {
        assert!(SeverityLadder::default().is_well_ordered());
        let inverted = SeverityLadder {
            high: 1.0,
            medium: 2.0,
            low: 3.0,
        };
        assert!(!inverted.is_well_ordered());
    }

    #[test]
    fn explanations_describe_the_signal() {
        let ts = datetime!(2024-03-01 14:05:00 UTC);
        assert_eq!(
            explanation(AnomalyKind::Trend, ts, 100.0, Some(220.0), 7.0),
            "Sudden deviation from trend: 120.0 W difference"
        );
        assert_eq!(
            explanation(AnomalyKind::Seasonal, ts, 400.0, Some(142.9), 2.46),
            "Unusual consumption for 14:00, 2.5 standard deviations from normal"
        );
        assert!(explanation(AnomalyKind::ReadingZscore, ts, 900.0, Some(100.0), 4.0).contains("4.0 standard"));
    }

    #[test]
    fn anomaly_id_is_stable_and_kind_sensitive() {
        let ts = datetime!(2024-03-01 10:00:00 UTC);
        let a = anomaly_id("D1", ts, AnomalyKind::HourlyZscore);
        assert_eq!(a, anomaly_id("D1", ts, AnomalyKind::HourlyZscore));
        assert_ne!(a, anomaly_id("D1", ts, AnomalyKind::ReadingZscore));
        assert_ne!(a, anomaly_id("D2", ts, AnomalyKind::HourlyZscore));
    }
}
