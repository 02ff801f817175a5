//! Sample normalization
//!
//! This module turns a decoded raw record into a canonical [`Sample`]:
//! - Altitude field aliases collapse onto `altitude_m`
//! - Encoded outlier annotations are decoded (or dropped)
//! - Missing or non-finite required fields become zero
//! - Power, total acceleration and pedal percentages are back-filled

use crate::error::EngineError;
use crate::types::{OutlierInfo, Sample};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Accepted altitude keys, highest priority first
pub const ALTITUDE_ALIASES: [&str; 4] = ["altitude_m", "altitude", "gps_altitude", "elevation"];

/// Fields guaranteed to be present after normalization
pub const REQUIRED_FIELDS: [&str; 18] = [
    "speed_ms",
    "voltage_v",
    "current_a",
    "power_w",
    "energy_j",
    "distance_m",
    "latitude",
    "longitude",
    "altitude_m",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "accel_x",
    "accel_y",
    "accel_z",
    "total_acceleration",
    "throttle_pct",
    "brake_pct",
];

// Keys consumed explicitly; everything else lands in `Sample::extra`.
const CONSUMED_KEYS: [&str; 10] = [
    "session_id",
    "timestamp",
    "message_id",
    "seq",
    "outliers",
    "provisional",
    "uptime_seconds",
    "data_source",
    "throttle",
    "brake",
];

/// Normalizer for converting raw records to canonical samples
pub struct Normalizer;

impl Normalizer {
    /// Normalize one raw record
    ///
    /// `fallback_session` is used when the record carries no session id.
    pub fn normalize(raw: &Value, fallback_session: Option<&str>) -> Result<Sample, EngineError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| EngineError::Decode("record is not a JSON object".into()))?;

        let session_id = match obj.get("session_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => fallback_session
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| EngineError::Decode("missing session_id".into()))?,
        };

        let timestamp = obj
            .get("timestamp")
            .ok_or_else(|| EngineError::Decode("missing timestamp".into()))
            .and_then(parse_timestamp)?;

        let mut sample = Sample::empty(session_id, timestamp);
        sample.message_id = obj
            .get("message_id")
            .or_else(|| obj.get("seq"))
            .and_then(as_sequence);
        sample.provisional = obj
            .get("provisional")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        sample.uptime_seconds = obj.get("uptime_seconds").and_then(as_number);
        sample.data_source = obj
            .get("data_source")
            .and_then(Value::as_str)
            .map(str::to_string);
        sample.outliers = obj.get("outliers").and_then(decode_outliers);

        for field in REQUIRED_FIELDS {
            let value = if field == "altitude_m" {
                resolve_altitude(obj)
            } else {
                obj.get(field).and_then(as_number)
            };
            match value {
                Some(v) => {
                    sample.set_field(field, v);
                }
                None => sample.defaulted_fields.push(field.to_string()),
            }
        }

        backfill_computed_fields(&mut sample, obj);

        for (key, value) in obj {
            if CONSUMED_KEYS.contains(&key.as_str())
                || REQUIRED_FIELDS.contains(&key.as_str())
                || ALTITUDE_ALIASES.contains(&key.as_str())
            {
                continue;
            }
            sample.extra.insert(key.clone(), value.clone());
        }

        Ok(sample)
    }
}

/// Parse RFC 3339, naive ISO-8601 (taken as UTC) or epoch milliseconds
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, EngineError> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Ok(Utc.from_utc_datetime(&naive));
                }
            }
            Err(EngineError::Decode(format!("unparsable timestamp {s:?}")))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| EngineError::Decode(format!("timestamp out of range: {n}"))),
        other => Err(EngineError::Decode(format!(
            "timestamp has unsupported type: {other}"
        ))),
    }
}

fn resolve_altitude(obj: &Map<String, Value>) -> Option<f64> {
    ALTITUDE_ALIASES
        .iter()
        .find_map(|key| obj.get(*key).and_then(as_number))
}

/// Decode an outlier annotation; anything malformed is dropped
fn decode_outliers(value: &Value) -> Option<OutlierInfo> {
    let decoded = match value {
        Value::Null => None,
        Value::String(encoded) => serde_json::from_str::<OutlierInfo>(encoded).ok(),
        Value::Object(_) => serde_json::from_value::<OutlierInfo>(value.clone()).ok(),
        _ => None,
    };
    decoded.filter(|info| !info.is_empty())
}

/// Finite number from a JSON number or numeric string
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    // Non-finite readings are treated as absent and zero-filled.
    n.is_finite().then_some(n)
}

fn as_sequence(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn backfill_computed_fields(sample: &mut Sample, obj: &Map<String, Value>) {
    if sample.power_w == 0.0 {
        sample.power_w = sample.voltage_v * sample.current_a;
    }

    if sample.total_acceleration == 0.0 {
        sample.total_acceleration = (sample.accel_x.powi(2)
            + sample.accel_y.powi(2)
            + sample.accel_z.powi(2))
        .sqrt();
    }

    // Pedals may arrive as 0..1 fractions instead of percentages.
    if sample.throttle_pct == 0.0 {
        if let Some(fraction) = obj.get("throttle").and_then(as_number) {
            sample.throttle_pct = fraction.clamp(0.0, 1.0) * 100.0;
        }
    }
    if sample.brake_pct == 0.0 {
        if let Some(fraction) = obj.get("brake").and_then(as_number) {
            sample.brake_pct = fraction.clamp(0.0, 1.0) * 100.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use serde_json::json;

    #[test]
    fn test_fills_required_fields_with_zero() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "speed_ms": 12.5
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();

        assert_eq!(sample.session_id, "s1");
        assert_eq!(sample.speed_ms, 12.5);
        assert_eq!(sample.voltage_v, 0.0);
        assert_eq!(sample.accel_z, 0.0);
        assert!(sample.is_defaulted("voltage_v"));
        assert!(!sample.is_defaulted("speed_ms"));
        assert_eq!(sample.defaulted_fields.len(), REQUIRED_FIELDS.len() - 1);
    }

    #[test]
    fn test_altitude_alias_priority() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "elevation": 5.0,
            "altitude": 120.0
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        assert_eq!(sample.altitude_m, 120.0);
        assert!(!sample.is_defaulted("altitude_m"));
        assert!(!sample.extra.contains_key("elevation"));

        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "altitude_m": 80.0,
            "altitude": 120.0
        });
        assert_eq!(Normalizer::normalize(&raw, None).unwrap().altitude_m, 80.0);
    }

    #[test]
    fn test_outliers_decoded_from_string() {
        let encoded = json!({
            "flagged_fields": ["voltage_v"],
            "confidence": {"voltage_v": 0.95},
            "reasons": {"voltage_v": "absolute_bound"},
            "severity": "critical"
        })
        .to_string();
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "outliers": encoded
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        let outliers = sample.outliers.unwrap();
        assert_eq!(outliers.severity, Severity::Critical);
        assert_eq!(outliers.flagged_fields, vec!["voltage_v".to_string()]);
    }

    #[test]
    fn test_malformed_outliers_dropped() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "outliers": "{not json"
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        assert!(sample.outliers.is_none());
    }

    #[test]
    fn test_non_finite_and_string_numbers() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "voltage_v": "48.5",
            "current_a": "NaN"
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        assert_eq!(sample.voltage_v, 48.5);
        assert_eq!(sample.current_a, 0.0);
        assert!(sample.is_defaulted("current_a"));
    }

    #[test]
    fn test_computed_fields_backfilled() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "voltage_v": 50.0,
            "current_a": 4.0,
            "accel_x": 3.0,
            "accel_y": 4.0,
            "throttle": 0.25
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        assert_eq!(sample.power_w, 200.0);
        assert_eq!(sample.total_acceleration, 5.0);
        assert_eq!(sample.throttle_pct, 25.0);
    }

    #[test]
    fn test_timestamp_formats() {
        let rfc = parse_timestamp(&json!("2024-03-01T10:00:00.250+00:00")).unwrap();
        let naive = parse_timestamp(&json!("2024-03-01T10:00:00.250")).unwrap();
        let epoch = parse_timestamp(&json!(rfc.timestamp_millis())).unwrap();
        assert_eq!(rfc, naive);
        assert_eq!(rfc, epoch);
        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert!(parse_timestamp(&json!(true)).is_err());
    }

    #[test]
    fn test_decode_errors() {
        assert!(Normalizer::normalize(&json!([1, 2]), None).is_err());
        let no_session = json!({"timestamp": "2024-03-01T10:00:00Z"});
        assert!(Normalizer::normalize(&no_session, None).is_err());
        assert!(Normalizer::normalize(&json!({"session_id": "s1"}), None).is_err());

        let sample =
            Normalizer::normalize(&json!({"timestamp": "2024-03-01T10:00:00Z"}), Some("live"))
                .unwrap();
        assert_eq!(sample.session_id, "live");
    }

    #[test]
    fn test_sequence_and_extra_fields() {
        let raw = json!({
            "session_id": "s1",
            "timestamp": "2024-03-01T10:00:00Z",
            "seq": 42,
            "session_name": "Practice",
            "provisional": true
        });
        let sample = Normalizer::normalize(&raw, None).unwrap();
        assert_eq!(sample.message_id, Some(42));
        assert!(sample.provisional);
        assert_eq!(sample.extra.get("session_name"), Some(&json!("Practice")));
        assert!(!sample.extra.contains_key("seq"));
    }
}
