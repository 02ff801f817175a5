//! KPI and data-quality aggregation
//!
//! Everything here is a pure function of a buffer snapshot; no running state
//! is kept between calls.

use crate::types::{Sample, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fields whose absence counts against data quality
pub const KEY_FIELDS: [&str; 10] = [
    "speed_ms",
    "voltage_v",
    "current_a",
    "power_w",
    "latitude",
    "longitude",
    "altitude_m",
    "accel_x",
    "accel_y",
    "accel_z",
];

/// Maximum score penalty from missing fields
pub const MAX_MISSING_PENALTY: f64 = 40.0;

const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Summary statistics over the current buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub total_distance_km: f64,
    pub total_energy_kwh: f64,
    pub max_speed_kmh: f64,
    /// Mean over non-zero speeds
    pub avg_speed_kmh: f64,
    pub avg_power_w: f64,
    pub max_power_w: f64,
    pub duration_s: f64,
    /// Distance per unit energy; `None` until energy has been consumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency_km_per_kwh: Option<f64>,
    pub sample_count: usize,
}

/// Data-quality report over the current buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Share of samples (0-1) lacking each key field
    pub missing_rates: BTreeMap<String, f64>,
    /// Samples carrying an outlier annotation
    pub outlier_count: usize,
    pub severity_counts: BTreeMap<Severity, usize>,
    /// Time since the newest sample (ms); `None` for an empty buffer
    pub freshness_ms: Option<i64>,
    pub stale: bool,
    /// Composite score, 0-100
    pub score: f64,

    // Stream counters, filled in by the processor
    pub decode_errors: u64,
    pub duplicates: u64,
    pub late_dropped: u64,
    pub ordering_violations: u64,
    /// Live samples pushed out of a full backfill queue
    pub queue_evicted: u64,
    /// Backfills that hit the record cap and kept only the newest history
    pub truncated_backfills: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub kpis: Kpis,
    pub quality: QualityReport,
}

/// Score penalty per outlier of the given severity
pub fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 5.0,
        Severity::High => 2.0,
        Severity::Medium => 1.0,
        Severity::Low => 0.25,
    }
}

/// Compute KPIs and the quality report for `buffer` as of `now`
pub fn summarize(buffer: &[Sample], now: DateTime<Utc>, stale_after_ms: i64) -> Summary {
    Summary {
        kpis: compute_kpis(buffer),
        quality: assess_quality(buffer, now, stale_after_ms),
    }
}

pub fn compute_kpis(buffer: &[Sample]) -> Kpis {
    let (first, last) = match (buffer.first(), buffer.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Kpis::default(),
    };

    let total_distance_km = last.distance_m / 1000.0;
    let total_energy_kwh = last.energy_j / JOULES_PER_KWH;

    let moving: Vec<f64> = buffer
        .iter()
        .map(|s| s.speed_ms)
        .filter(|v| *v != 0.0)
        .collect();
    let avg_speed_kmh = mean(&moving).unwrap_or(0.0) * 3.6;
    let max_speed_kmh = buffer.iter().map(|s| s.speed_ms).fold(0.0, f64::max) * 3.6;

    let powers: Vec<f64> = buffer.iter().map(|s| s.power_w).collect();
    let avg_power_w = mean(&powers).unwrap_or(0.0);
    let max_power_w = powers.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let duration_s = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0;

    let efficiency_km_per_kwh =
        (total_energy_kwh > 0.0).then(|| total_distance_km / total_energy_kwh);

    Kpis {
        total_distance_km,
        total_energy_kwh,
        max_speed_kmh,
        avg_speed_kmh,
        avg_power_w,
        max_power_w,
        duration_s,
        efficiency_km_per_kwh,
        sample_count: buffer.len(),
    }
}

pub fn assess_quality(buffer: &[Sample], now: DateTime<Utc>, stale_after_ms: i64) -> QualityReport {
    let total = buffer.len();

    let missing_rates: BTreeMap<String, f64> = KEY_FIELDS
        .iter()
        .map(|field| {
            let missing = buffer.iter().filter(|s| s.is_defaulted(field)).count();
            let rate = if total == 0 {
                0.0
            } else {
                missing as f64 / total as f64
            };
            (field.to_string(), rate)
        })
        .collect();

    let mut severity_counts: BTreeMap<Severity, usize> = BTreeMap::new();
    let mut outlier_count = 0;
    for info in buffer.iter().filter_map(|s| s.outliers.as_ref()) {
        if info.is_empty() {
            continue;
        }
        outlier_count += 1;
        *severity_counts.entry(info.severity).or_insert(0) += 1;
    }

    let freshness_ms = buffer
        .last()
        .map(|s| (now - s.timestamp).num_milliseconds());
    let stale = freshness_ms.is_some_and(|age| age > stale_after_ms);

    let mean_missing = mean(&missing_rates.values().copied().collect::<Vec<_>>()).unwrap_or(0.0);
    let missing_penalty = (mean_missing * 100.0 * 0.4).min(MAX_MISSING_PENALTY);
    let severity_penalty: f64 = severity_counts
        .iter()
        .map(|(severity, count)| severity_weight(*severity) * *count as f64)
        .sum();
    let score = (100.0 - missing_penalty - severity_penalty).clamp(0.0, 100.0);

    QualityReport {
        missing_rates,
        outlier_count,
        severity_counts,
        freshness_ms,
        stale,
        score,
        decode_errors: 0,
        duplicates: 0,
        late_dropped: 0,
        ordering_violations: 0,
        queue_evicted: 0,
        truncated_backfills: 0,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}
