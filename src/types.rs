//! Core types for the telemetry-flux engine
//!
//! This module defines the data structures that flow through each stage of the
//! engine: normalized samples, derived fields, outlier annotations and the
//! identity key used for deduplication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity of an outlier annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "info")]
    Low,
    #[serde(alias = "warning")]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Outlier annotation, from the upstream producer or the built-in detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierInfo {
    /// Fields the detector flagged
    #[serde(default)]
    pub flagged_fields: Vec<String>,
    /// Per-field confidence (0-1)
    #[serde(default)]
    pub confidence: BTreeMap<String, f64>,
    /// Per-field reason code
    #[serde(default)]
    pub reasons: BTreeMap<String, String>,
    /// Overall severity for the sample
    pub severity: Severity,
}

impl OutlierInfo {
    pub fn is_empty(&self) -> bool {
        self.flagged_fields.is_empty()
    }
}

/// Coarse motion classification derived from speed and filtered g-force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Stationary,
    Accelerating,
    Braking,
    Cornering,
    Cruising,
}

/// Values computed by the derived-signal pipeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    /// Roll angle (degrees)
    pub roll_deg: f64,
    /// Pitch angle (degrees)
    pub pitch_deg: f64,
    /// Longitudinal g-force (bias-corrected, smoothed)
    pub g_long: f64,
    /// Lateral g-force (bias-corrected, smoothed)
    pub g_lat: f64,
    /// Magnitude of the longitudinal and lateral components
    pub g_total: f64,
    /// Speed (km/h)
    pub speed_kmh: f64,
    /// Motion classification
    pub motion: MotionState,
}

/// One normalized telemetry observation
///
/// Every required numeric field is populated after normalization; fields the
/// raw record lacked are zero and listed in `defaulted_fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonically assigned message sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,

    pub speed_ms: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    /// Cumulative energy (joules)
    pub energy_j: f64,
    /// Cumulative distance (meters)
    pub distance_m: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub total_acceleration: f64,
    pub throttle_pct: f64,
    pub brake_pct: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outliers: Option<OutlierInfo>,

    /// Synthesized to represent a gap rather than observed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
    /// Required fields the normalizer had to zero-fill
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaulted_fields: Vec<String>,
    /// Raw keys outside the known field set
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived: Option<DerivedFields>,
}

impl Sample {
    /// An all-zero sample for the given session and instant
    pub fn empty(session_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            message_id: None,
            speed_ms: 0.0,
            voltage_v: 0.0,
            current_a: 0.0,
            power_w: 0.0,
            energy_j: 0.0,
            distance_m: 0.0,
            latitude: 0.0,
            longitude: 0.0,
            altitude_m: 0.0,
            gyro_x: 0.0,
            gyro_y: 0.0,
            gyro_z: 0.0,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 0.0,
            total_acceleration: 0.0,
            throttle_pct: 0.0,
            brake_pct: 0.0,
            uptime_seconds: None,
            data_source: None,
            outliers: None,
            provisional: false,
            defaulted_fields: Vec::new(),
            extra: BTreeMap::new(),
            derived: None,
        }
    }

    pub fn key(&self) -> SampleKey {
        SampleKey {
            timestamp_ms: self.timestamp.timestamp_millis(),
            message_id: self.message_id,
        }
    }

    /// Whether `field` was absent from the raw record
    pub fn is_defaulted(&self, field: &str) -> bool {
        self.defaulted_fields.iter().any(|f| f == field)
    }

    /// Value of a required numeric field by its canonical name
    pub fn field(&self, name: &str) -> Option<f64> {
        let value = match name {
            "speed_ms" => self.speed_ms,
            "voltage_v" => self.voltage_v,
            "current_a" => self.current_a,
            "power_w" => self.power_w,
            "energy_j" => self.energy_j,
            "distance_m" => self.distance_m,
            "latitude" => self.latitude,
            "longitude" => self.longitude,
            "altitude_m" => self.altitude_m,
            "gyro_x" => self.gyro_x,
            "gyro_y" => self.gyro_y,
            "gyro_z" => self.gyro_z,
            "accel_x" => self.accel_x,
            "accel_y" => self.accel_y,
            "accel_z" => self.accel_z,
            "total_acceleration" => self.total_acceleration,
            "throttle_pct" => self.throttle_pct,
            "brake_pct" => self.brake_pct,
            _ => return None,
        };
        Some(value)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut f64> {
        let slot = match name {
            "speed_ms" => &mut self.speed_ms,
            "voltage_v" => &mut self.voltage_v,
            "current_a" => &mut self.current_a,
            "power_w" => &mut self.power_w,
            "energy_j" => &mut self.energy_j,
            "distance_m" => &mut self.distance_m,
            "latitude" => &mut self.latitude,
            "longitude" => &mut self.longitude,
            "altitude_m" => &mut self.altitude_m,
            "gyro_x" => &mut self.gyro_x,
            "gyro_y" => &mut self.gyro_y,
            "gyro_z" => &mut self.gyro_z,
            "accel_x" => &mut self.accel_x,
            "accel_y" => &mut self.accel_y,
            "accel_z" => &mut self.accel_z,
            "total_acceleration" => &mut self.total_acceleration,
            "throttle_pct" => &mut self.throttle_pct,
            "brake_pct" => &mut self.brake_pct,
            _ => return None,
        };
        Some(slot)
    }

    /// Set a required numeric field; returns false for unknown names
    pub fn set_field(&mut self, name: &str, value: f64) -> bool {
        match self.field_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Chartable value by name, including derived fields
    pub fn value(&self, name: &str) -> Option<f64> {
        if let Some(v) = self.field(name) {
            return Some(v);
        }
        let derived = self.derived.as_ref()?;
        match name {
            "roll_deg" => Some(derived.roll_deg),
            "pitch_deg" => Some(derived.pitch_deg),
            "g_long" => Some(derived.g_long),
            "g_lat" => Some(derived.g_lat),
            "g_total" => Some(derived.g_total),
            "speed_kmh" => Some(derived.speed_kmh),
            _ => None,
        }
    }
}

/// Identity key used for deduplication: `(timestamp_millis, sequence or empty)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SampleKey {
    pub timestamp_ms: i64,
    pub message_id: Option<u64>,
}

/// Lifecycle of the active session inside the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session has been seen since the last reset
    Idle,
    /// History for a session is being fetched; live samples are queued
    Backfilling,
    /// Buffer is complete and filter state is consistent
    Ready,
    /// History hit the record cap; the buffer starts at the newest records
    /// kept and filter state was seeded from them rather than the session start
    Partial,
    /// The last backfill failed; the buffer holds the last good state
    NotReady,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_severity_aliases() {
        let info: OutlierInfo =
            serde_json::from_str(r#"{"flagged_fields":["voltage_v"],"severity":"warning"}"#)
                .unwrap();
        assert_eq!(info.severity, Severity::Medium);

        let info: OutlierInfo =
            serde_json::from_str(r#"{"flagged_fields":[],"severity":"info"}"#).unwrap();
        assert_eq!(info.severity, Severity::Low);
        assert!(info.is_empty());

        let bad = serde_json::from_str::<OutlierInfo>(r#"{"severity":"apocalyptic"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_key_uses_millis_and_sequence() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut sample = Sample::empty("s1", ts);
        assert_eq!(
            sample.key(),
            SampleKey {
                timestamp_ms: 1_700_000_000_123,
                message_id: None
            }
        );

        sample.message_id = Some(7);
        assert_eq!(sample.key().message_id, Some(7));
    }

    #[test]
    fn test_value_lookup_includes_derived() {
        let mut sample = Sample::empty("s1", Utc::now());
        assert!(sample.set_field("speed_ms", 10.0));
        assert!(!sample.set_field("warp_factor", 9.0));
        assert_eq!(sample.value("speed_ms"), Some(10.0));
        assert_eq!(sample.value("speed_kmh"), None);

        sample.derived = Some(DerivedFields {
            roll_deg: 0.0,
            pitch_deg: 0.0,
            g_long: 0.0,
            g_lat: 0.0,
            g_total: 0.0,
            speed_kmh: 36.0,
            motion: MotionState::Cruising,
        });
        assert_eq!(sample.value("speed_kmh"), Some(36.0));
    }
}
