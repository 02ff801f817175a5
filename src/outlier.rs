//! Rolling-window outlier detection
//!
//! [`OutlierDetector`] annotates samples that arrive without an upstream
//! annotation. Checks cover electrical bounds and jumps, IMU magnitude and
//! gyro rate, GPS bounds and jumps, speed limits, cumulative regressions and
//! stuck sensors. The detector keeps per-field rolling windows, so it must see
//! a session's samples in timestamp order and is reset with the filter state.

use crate::types::{OutlierInfo, Sample, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Fields with rolling statistics and stuck-value tracking
pub const ROLLING_FIELDS: [&str; 10] = [
    "voltage_v",
    "current_a",
    "power_w",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "accel_x",
    "accel_y",
    "accel_z",
    "speed_ms",
];

/// A flag on any of these makes the whole annotation critical
pub const CRITICAL_FIELDS: [&str; 3] = ["voltage_v", "current_a", "power_w"];

/// Window depth needed before z-scores are trusted
const MIN_STAT_SAMPLES: usize = 10;

// Flat-earth degree lengths, good enough for sample-to-sample jumps
const METERS_PER_DEG_LAT: f64 = 111_000.0;
const METERS_PER_DEG_LON: f64 = 78_000.0;

/// Below this speed (m/s) the vehicle should not be rotating
const STATIONARY_SPEED_MS: f64 = 0.5;
const STATIONARY_GYRO_MAX: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    pub window_size: usize,
    pub z_score_threshold: f64,
    pub voltage_min: f64,
    pub voltage_max: f64,
    pub current_min: f64,
    pub current_max: f64,
    pub power_min: f64,
    pub power_max: f64,
    /// Relative deviation from the rolling voltage mean that counts as a jump
    pub electrical_jump_pct: f64,
    /// Consecutive identical readings before a sensor counts as stuck
    pub stuck_sensor_count: u32,
    pub accel_magnitude_max: f64,
    /// Largest plausible gyro change between consecutive samples
    pub gyro_rate_max: f64,
    pub altitude_min: f64,
    pub altitude_max: f64,
    /// GPS distance over speed-implied distance
    pub gps_speed_distance_ratio: f64,
    /// GPS-implied speed (m/s) that cannot be real
    pub gps_impossible_speed: f64,
    /// Altitude change (m) between consecutive samples
    pub altitude_rate_max: f64,
    pub speed_max: f64,
    /// Speed change rate (m/s²) that cannot be real
    pub speed_impossible_accel: f64,
    /// Nominal spacing between samples (s)
    pub sample_interval_s: f64,
    pub energy_jump_j: f64,
    pub distance_jump_m: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            z_score_threshold: 5.0,
            voltage_min: 35.0,
            voltage_max: 60.0,
            current_min: -10.0,
            current_max: 35.0,
            power_min: -500.0,
            power_max: 2500.0,
            electrical_jump_pct: 0.5,
            stuck_sensor_count: 15,
            accel_magnitude_max: 80.0,
            gyro_rate_max: 1000.0,
            altitude_min: -500.0,
            altitude_max: 10_000.0,
            gps_speed_distance_ratio: 20.0,
            gps_impossible_speed: 500.0,
            altitude_rate_max: 50.0,
            speed_max: 50.0,
            speed_impossible_accel: 50.0,
            sample_interval_s: 0.2,
            energy_jump_j: 50_000.0,
            distance_jump_m: 100.0,
        }
    }
}

/// Why a field was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierReason {
    ZScoreExceeded,
    AbsoluteBound,
    SuddenJump,
    StuckSensor,
    MagnitudeExceeded,
    RateOfChange,
    CrossValidationFailed,
    GpsSpeedMismatch,
    ImpossibleSpeed,
    AltitudeRate,
    NegativeValue,
    NonMonotonic,
    ImplausibleIncrease,
}

impl OutlierReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutlierReason::ZScoreExceeded => "z_score_exceeded",
            OutlierReason::AbsoluteBound => "absolute_bound",
            OutlierReason::SuddenJump => "sudden_jump",
            OutlierReason::StuckSensor => "stuck_sensor",
            OutlierReason::MagnitudeExceeded => "magnitude_exceeded",
            OutlierReason::RateOfChange => "rate_of_change",
            OutlierReason::CrossValidationFailed => "cross_validation_failed",
            OutlierReason::GpsSpeedMismatch => "gps_speed_mismatch",
            OutlierReason::ImpossibleSpeed => "impossible_speed",
            OutlierReason::AltitudeRate => "altitude_rate",
            OutlierReason::NegativeValue => "negative_value",
            OutlierReason::NonMonotonic => "non_monotonic",
            OutlierReason::ImplausibleIncrease => "implausible_increase",
        }
    }
}

/// Fixed-depth window of recent readings
#[derive(Debug, Clone)]
struct RollingWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl RollingWindow {
    fn new(cap: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation
    fn std(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / self.values.len() as f64;
        var.sqrt()
    }

    fn z_score(&self, value: f64) -> Option<f64> {
        let std = self.std();
        (std > 0.0).then(|| (value - self.mean()).abs() / std)
    }
}

/// Flags collected for one sample
#[derive(Debug, Default)]
struct Findings {
    confidence: BTreeMap<String, f64>,
    reasons: BTreeMap<String, String>,
}

impl Findings {
    fn flag(&mut self, field: &str, confidence: f64, reason: OutlierReason) {
        self.confidence.insert(field.to_string(), confidence);
        self.reasons.insert(field.to_string(), reason.as_str().to_string());
    }

    /// Flag unless an earlier check already explained this field
    fn flag_once(&mut self, field: &str, confidence: f64, reason: OutlierReason) {
        if !self.contains(field) {
            self.flag(field, confidence, reason);
        }
    }

    fn contains(&self, field: &str) -> bool {
        self.reasons.contains_key(field)
    }

    fn severity(&self) -> Severity {
        if CRITICAL_FIELDS.iter().any(|f| self.contains(f)) {
            Severity::Critical
        } else if self.reasons.len() >= 3 {
            Severity::High
        } else if self.confidence.values().any(|c| *c > 0.9) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn into_info(self) -> Option<OutlierInfo> {
        if self.reasons.is_empty() {
            return None;
        }
        let severity = self.severity();
        Some(OutlierInfo {
            flagged_fields: self.reasons.keys().cloned().collect(),
            confidence: self.confidence,
            reasons: self.reasons,
            severity,
        })
    }
}

/// A field's value, unless the normalizer had to zero-fill it
fn present(sample: &Sample, field: &str) -> Option<f64> {
    if sample.is_defaulted(field) {
        return None;
    }
    sample.field(field)
}

#[derive(Debug, Clone)]
pub struct OutlierDetector {
    config: OutlierConfig,
    windows: HashMap<&'static str, RollingWindow>,
    /// Previous (latitude, longitude, altitude)
    last_fix: Option<(f64, f64, f64)>,
    last_energy: Option<f64>,
    last_distance: Option<f64>,
    /// Last reading and how many times it repeated
    repeats: HashMap<&'static str, (f64, u32)>,
    inspected: u64,
    flagged: u64,
}

impl Default for OutlierDetector {
    fn default() -> Self {
        Self::new(OutlierConfig::default())
    }
}

impl OutlierDetector {
    pub fn new(config: OutlierConfig) -> Self {
        let windows = ROLLING_FIELDS
            .iter()
            .map(|f| (*f, RollingWindow::new(config.window_size)))
            .collect();
        Self {
            config,
            windows,
            last_fix: None,
            last_energy: None,
            last_distance: None,
            repeats: HashMap::new(),
            inspected: 0,
            flagged: 0,
        }
    }

    /// Samples inspected since the last reset
    pub fn inspected(&self) -> u64 {
        self.inspected
    }

    /// Samples that produced an annotation since the last reset
    pub fn flagged(&self) -> u64 {
        self.flagged
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Inspect the next sample of the session and advance the windows
    pub fn inspect(&mut self, sample: &Sample) -> Option<OutlierInfo> {
        let mut findings = Findings::default();
        self.check_electrical(sample, &mut findings);
        self.check_imu(sample, &mut findings);
        self.check_gps(sample, &mut findings);
        self.check_speed(sample, &mut findings);
        self.check_cumulative(sample, &mut findings);
        self.check_stuck(sample, &mut findings);
        self.update_windows(sample);

        self.inspected += 1;
        let info = findings.into_info();
        if info.is_some() {
            self.flagged += 1;
        }
        info
    }

    fn window(&self, field: &str) -> Option<&RollingWindow> {
        self.windows.get(field)
    }

    fn check_electrical(&self, sample: &Sample, findings: &mut Findings) {
        let cfg = &self.config;

        if let Some(v) = present(sample, "voltage_v") {
            if v < cfg.voltage_min || v > cfg.voltage_max {
                findings.flag("voltage_v", 1.0, OutlierReason::AbsoluteBound);
            } else if let Some(window) = self.window("voltage_v") {
                if window.len() >= MIN_STAT_SAMPLES {
                    if let Some(z) = window.z_score(v) {
                        if z > cfg.z_score_threshold {
                            let confidence = (z / (cfg.z_score_threshold * 2.0)).min(1.0);
                            findings.flag("voltage_v", confidence, OutlierReason::ZScoreExceeded);
                        }
                    }
                    let mean = window.mean();
                    if mean > 0.0 && (v - mean).abs() / mean > cfg.electrical_jump_pct {
                        findings.flag_once("voltage_v", 0.7, OutlierReason::SuddenJump);
                    }
                }
            }
        }

        if let Some(c) = present(sample, "current_a") {
            if c < cfg.current_min || c > cfg.current_max {
                findings.flag("current_a", 1.0, OutlierReason::AbsoluteBound);
            } else if let Some(window) = self.window("current_a") {
                if window.len() >= MIN_STAT_SAMPLES {
                    if let Some(z) = window.z_score(c) {
                        if z > cfg.z_score_threshold {
                            let confidence = (z / (cfg.z_score_threshold * 2.0)).min(1.0);
                            findings.flag("current_a", confidence, OutlierReason::ZScoreExceeded);
                        }
                    }
                }
            }
        }

        if let Some(p) = present(sample, "power_w") {
            if p < cfg.power_min || p > cfg.power_max {
                findings.flag("power_w", 1.0, OutlierReason::AbsoluteBound);
            }
        }
    }

    fn check_imu(&self, sample: &Sample, findings: &mut Findings) {
        let cfg = &self.config;

        let axes = [
            ("accel_x", present(sample, "accel_x")),
            ("accel_y", present(sample, "accel_y")),
            ("accel_z", present(sample, "accel_z")),
        ];
        if axes.iter().any(|(_, v)| v.is_some()) {
            let magnitude = axes
                .iter()
                .map(|(_, v)| v.unwrap_or(0.0).powi(2))
                .sum::<f64>()
                .sqrt();
            if magnitude > cfg.accel_magnitude_max {
                let primary = axes
                    .iter()
                    .max_by(|a, b| {
                        let (a, b) = (a.1.unwrap_or(0.0).abs(), b.1.unwrap_or(0.0).abs());
                        a.total_cmp(&b)
                    })
                    .map_or("accel_x", |(field, _)| *field);
                let confidence = (magnitude / cfg.accel_magnitude_max).min(1.0);
                findings.flag(primary, confidence, OutlierReason::MagnitudeExceeded);
            }
        }

        for field in ["gyro_x", "gyro_y", "gyro_z"] {
            let (Some(value), Some(previous)) =
                (present(sample, field), self.window(field).and_then(RollingWindow::last))
            else {
                continue;
            };
            let rate = (value - previous).abs();
            if rate > cfg.gyro_rate_max {
                let confidence = (rate / (cfg.gyro_rate_max * 2.0)).min(1.0);
                findings.flag(field, confidence, OutlierReason::RateOfChange);
            }
        }

        let speed = present(sample, "speed_ms").unwrap_or(0.0);
        if speed < STATIONARY_SPEED_MS && present(sample, "gyro_z").is_some() {
            let gyro = ["gyro_x", "gyro_y", "gyro_z"]
                .iter()
                .map(|f| present(sample, f).unwrap_or(0.0).powi(2))
                .sum::<f64>()
                .sqrt();
            if gyro > STATIONARY_GYRO_MAX {
                findings.flag_once("gyro_z", 0.6, OutlierReason::CrossValidationFailed);
            }
        }
    }

    fn check_gps(&mut self, sample: &Sample, findings: &mut Findings) {
        let cfg = &self.config;
        let (Some(lat), Some(lon)) = (present(sample, "latitude"), present(sample, "longitude"))
        else {
            return;
        };
        let alt = present(sample, "altitude_m").unwrap_or(0.0);
        let speed = present(sample, "speed_ms").unwrap_or(0.0);

        if !(-90.0..=90.0).contains(&lat) {
            findings.flag("latitude", 1.0, OutlierReason::AbsoluteBound);
        }
        if !(-180.0..=180.0).contains(&lon) {
            findings.flag("longitude", 1.0, OutlierReason::AbsoluteBound);
        }
        if alt < cfg.altitude_min || alt > cfg.altitude_max {
            findings.flag("altitude_m", 1.0, OutlierReason::AbsoluteBound);
        }

        if let Some((prev_lat, prev_lon, prev_alt)) = self.last_fix {
            let dist_m = (((lat - prev_lat) * METERS_PER_DEG_LAT).powi(2)
                + ((lon - prev_lon) * METERS_PER_DEG_LON).powi(2))
            .sqrt();
            let dt = cfg.sample_interval_s;

            let expected_m = speed * dt;
            if expected_m > 0.0 {
                let ratio = dist_m / expected_m;
                if ratio > cfg.gps_speed_distance_ratio {
                    let confidence = (ratio / (cfg.gps_speed_distance_ratio * 2.0)).min(1.0);
                    findings.flag_once("latitude", confidence, OutlierReason::GpsSpeedMismatch);
                }
            }

            let implied_speed = dist_m / dt;
            if implied_speed > cfg.gps_impossible_speed {
                let confidence = (implied_speed / (cfg.gps_impossible_speed * 2.0)).min(1.0);
                findings.flag_once("latitude", confidence, OutlierReason::ImpossibleSpeed);
            }

            let climb = (alt - prev_alt).abs();
            if climb > cfg.altitude_rate_max {
                let confidence = (climb / (cfg.altitude_rate_max * 2.0)).min(1.0);
                findings.flag_once("altitude_m", confidence, OutlierReason::AltitudeRate);
            }
        }

        self.last_fix = Some((lat, lon, alt));
    }

    fn check_speed(&self, sample: &Sample, findings: &mut Findings) {
        let cfg = &self.config;
        let Some(speed) = present(sample, "speed_ms") else {
            return;
        };

        if speed < 0.0 {
            findings.flag("speed_ms", 1.0, OutlierReason::NegativeValue);
            return;
        }
        if speed > cfg.speed_max {
            let confidence = (speed / (cfg.speed_max * 1.5)).min(1.0);
            findings.flag("speed_ms", confidence, OutlierReason::AbsoluteBound);
            return;
        }
        if let Some(previous) = self.window("speed_ms").and_then(RollingWindow::last) {
            let accel = (speed - previous).abs() / cfg.sample_interval_s;
            if accel > cfg.speed_impossible_accel {
                let confidence = (accel / (cfg.speed_impossible_accel * 2.0)).min(1.0);
                findings.flag("speed_ms", confidence, OutlierReason::RateOfChange);
            }
        }
    }

    fn check_cumulative(&mut self, sample: &Sample, findings: &mut Findings) {
        if let Some(energy) = present(sample, "energy_j") {
            if let Some(last) = self.last_energy {
                if energy < last {
                    findings.flag("energy_j", 1.0, OutlierReason::NonMonotonic);
                } else if energy - last > self.config.energy_jump_j {
                    findings.flag("energy_j", 0.8, OutlierReason::ImplausibleIncrease);
                }
            }
            self.last_energy = Some(energy);
        }

        if let Some(distance) = present(sample, "distance_m") {
            if let Some(last) = self.last_distance {
                if distance < last {
                    findings.flag("distance_m", 1.0, OutlierReason::NonMonotonic);
                } else if distance - last > self.config.distance_jump_m {
                    findings.flag("distance_m", 0.8, OutlierReason::ImplausibleIncrease);
                }
            }
            self.last_distance = Some(distance);
        }
    }

    fn check_stuck(&mut self, sample: &Sample, findings: &mut Findings) {
        let threshold = self.config.stuck_sensor_count.max(1);
        for field in ROLLING_FIELDS {
            let Some(value) = present(sample, field) else {
                continue;
            };
            let repeats = match self.repeats.get_mut(field) {
                Some((last, count)) if *last == value => {
                    *count = count.saturating_add(1);
                    *count
                }
                _ => {
                    self.repeats.insert(field, (value, 0));
                    0
                }
            };
            if repeats >= threshold {
                let confidence = (repeats as f64 / (threshold as f64 * 2.0)).min(1.0);
                findings.flag_once(field, confidence, OutlierReason::StuckSensor);
            }
        }
    }

    fn update_windows(&mut self, sample: &Sample) {
        for field in ROLLING_FIELDS {
            let value = present(sample, field);
            if let (Some(value), Some(window)) = (value, self.windows.get_mut(field)) {
                window.push(value);
            }
        }
    }
}
