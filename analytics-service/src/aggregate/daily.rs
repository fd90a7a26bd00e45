use ecogrid_client::domain::{DailyAggregate, HourlyAggregate};

use super::{mean, sum};
use crate::config::AnalyticsConfig;

/// Roll hourly rows (sorted by hour, one device) up into UTC calendar days.
pub fn daily_aggregates(hourly: &[HourlyAggregate], cfg: &AnalyticsConfig) -> Vec<DailyAggregate> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < hourly.len() {
        let date = hourly[start].hour_ts.date();
        let len = hourly[start..]
            .iter()
            .take_while(|h| h.hour_ts.date() == date)
            .count();
        out.push(summarize_day(&hourly[start..start + len], cfg));
        start += len;
    }
    out
}

fn summarize_day(hours: &[HourlyAggregate], cfg: &AnalyticsConfig) -> DailyAggregate {
    let first = &hours[0];
    let hour_avgs: Vec<f64> = hours.iter().filter_map(|h| h.avg_power_w).collect();
    let avg_power = mean(hour_avgs.iter().copied());
    let total_energy = sum(hours.iter().filter_map(|h| h.total_energy_wh));

    // Strict comparison keeps the earliest hour on ties.
    let mut peak: Option<(u8, f64)> = None;
    for h in hours {
        if let Some(p) = h.max_power_w {
            if peak.map_or(true, |(_, best)| p > best) {
                peak = Some((h.hour_ts.hour(), p));
            }
        }
    }

    let t = &cfg.thresholds;
    let anomaly_count = avg_power
        .map(|day_avg| {
            hour_avgs
                .iter()
                .filter(|a| **a > t.spike_multiplier * day_avg)
                .count()
        })
        .unwrap_or(0);

    DailyAggregate {
        device_id: first.device_id.clone(),
        date: first.hour_ts.date(),
        hour_count: hours.len() as u32,
        total_energy_wh: total_energy,
        avg_power_w: avg_power,
        peak_power_w: peak.map(|(_, p)| p),
        peak_hour: peak.map(|(hour, _)| hour),
        low_power_hours: hour_avgs.iter().filter(|a| **a < t.low_power_w).count() as u32,
        anomaly_count: anomaly_count as u32,
        cost_usd: total_energy.map(|e| cfg.tariff.cost_usd(e)),
        carbon_kg: total_energy.map(|e| cfg.tariff.carbon_kg(e)),
    }
}
