//! Derived-signal pipeline
//!
//! Stateful, order-sensitive transform that attaches [`DerivedFields`] to
//! samples:
//! - Roll and pitch from the accelerometer gravity vector
//! - Longitudinal/lateral g-force with stationary bias calibration
//! - Speed in km/h and a coarse motion classification
//!
//! Samples must be fed in increasing timestamp order. Feeding an older sample
//! after a newer one corrupts every later g-force value until [`reset`].
//!
//! [`reset`]: DerivedSignalPipeline::reset

use crate::types::{DerivedFields, MotionState, Sample};
use serde::{Deserialize, Serialize};

/// Standard gravity (m/s²)
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Below this speed (m/s) the vehicle is treated as stationary
pub const STATIONARY_SPEED_MS: f64 = 0.6;

/// Smoothing factor of the bias accumulators
pub const BIAS_ALPHA: f64 = 0.02;

/// Smoothing factor of the g-force EMA
pub const EMA_ALPHA: f64 = 0.22;

/// g-force magnitude that counts as deliberate acceleration/braking/cornering
pub const MOTION_G_THRESHOLD: f64 = 0.15;

const DENOMINATOR_EPSILON: f64 = 1e-6;

/// Running accumulators of the g-force filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub bias_x: f64,
    pub bias_y: f64,
    pub ema_x: f64,
    pub ema_y: f64,
}

/// Pipeline that owns one [`FilterState`]
#[derive(Debug, Clone, Default)]
pub struct DerivedSignalPipeline {
    state: FilterState,
    processed: u64,
}

impl DerivedSignalPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Samples processed since the last reset
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Zero the filter state (session start, explicit reset, full replay)
    pub fn reset(&mut self) {
        self.state = FilterState::default();
        self.processed = 0;
    }

    /// Compute derived fields for one sample and advance the filter
    pub fn process(&mut self, sample: &mut Sample) -> DerivedFields {
        let (roll_deg, pitch_deg) = orientation(sample.accel_x, sample.accel_y, sample.accel_z);

        let stationary = sample.speed_ms.abs() < STATIONARY_SPEED_MS;
        let state = &mut self.state;
        if stationary {
            state.bias_x += BIAS_ALPHA * (sample.accel_x - state.bias_x);
            state.bias_y += BIAS_ALPHA * (sample.accel_y - state.bias_y);
        }
        state.ema_x += EMA_ALPHA * ((sample.accel_x - state.bias_x) - state.ema_x);
        state.ema_y += EMA_ALPHA * ((sample.accel_y - state.bias_y) - state.ema_y);

        let g_long = state.ema_x / STANDARD_GRAVITY;
        let g_lat = state.ema_y / STANDARD_GRAVITY;

        let derived = DerivedFields {
            roll_deg,
            pitch_deg,
            g_long,
            g_lat,
            g_total: g_long.hypot(g_lat),
            speed_kmh: sample.speed_ms * 3.6,
            motion: classify_motion(stationary, g_long, g_lat),
        };

        self.processed += 1;
        sample.derived = Some(derived);
        derived
    }

    /// Process a slice that is already sorted by timestamp
    pub fn process_ordered(&mut self, samples: &mut [Sample]) {
        for sample in samples.iter_mut() {
            self.process(sample);
        }
    }
}

/// Roll and pitch (degrees) from raw accelerometer axes
pub fn orientation(ax: f64, ay: f64, az: f64) -> (f64, f64) {
    let roll_den = (ax * ax + az * az).sqrt().max(DENOMINATOR_EPSILON);
    let pitch_den = (ay * ay + az * az).sqrt().max(DENOMINATOR_EPSILON);
    (
        ay.atan2(roll_den).to_degrees(),
        ax.atan2(pitch_den).to_degrees(),
    )
}

fn classify_motion(stationary: bool, g_long: f64, g_lat: f64) -> MotionState {
    if stationary {
        return MotionState::Stationary;
    }
    if g_lat.abs() >= MOTION_G_THRESHOLD && g_lat.abs() >= g_long.abs() {
        MotionState::Cornering
    } else if g_long >= MOTION_G_THRESHOLD {
        MotionState::Accelerating
    } else if g_long <= -MOTION_G_THRESHOLD {
        MotionState::Braking
    } else {
        MotionState::Cruising
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_sample(i: i64, speed: f64, ax: f64, ay: f64, az: f64) -> Sample {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
            + Duration::milliseconds(200 * i);
        let mut sample = Sample::empty("s1", ts);
        sample.speed_ms = speed;
        sample.accel_x = ax;
        sample.accel_y = ay;
        sample.accel_z = az;
        sample
    }

    fn drive_sequence() -> Vec<Sample> {
        (0..40)
            .map(|i| {
                let speed = if i < 10 { 0.0 } else { (i - 10) as f64 };
                make_sample(i, speed, 0.3 + 0.05 * (i % 7) as f64, -0.2, 9.8)
            })
            .collect()
    }

    #[test]
    fn test_orientation_level_and_tilted() {
        let (roll, pitch) = orientation(0.0, 0.0, 9.81);
        assert!(roll.abs() < 1e-9);
        assert!(pitch.abs() < 1e-9);

        let (roll, _) = orientation(0.0, 9.81, 9.81);
        assert!((roll - 45.0).abs() < 1e-9);

        // All-zero input must not divide by zero.
        let (roll, pitch) = orientation(0.0, 0.0, 0.0);
        assert!(roll.is_finite() && pitch.is_finite());
    }

    #[test]
    fn test_speed_conversion() {
        let mut pipeline = DerivedSignalPipeline::new();
        let mut sample = make_sample(0, 10.0, 0.0, 0.0, 9.8);
        let derived = pipeline.process(&mut sample);
        assert!((derived.speed_kmh - 36.0).abs() < 1e-9);
        assert_eq!(sample.derived, Some(derived));
    }

    #[test]
    fn test_bias_only_updates_while_stationary() {
        let mut pipeline = DerivedSignalPipeline::new();

        let mut moving = make_sample(0, 5.0, 1.0, 1.0, 9.8);
        pipeline.process(&mut moving);
        assert_eq!(pipeline.state().bias_x, 0.0);
        assert_eq!(pipeline.state().bias_y, 0.0);

        let mut parked = make_sample(1, 0.1, 1.0, 0.5, 9.8);
        pipeline.process(&mut parked);
        assert!((pipeline.state().bias_x - 0.02).abs() < 1e-12);
        assert!((pipeline.state().bias_y - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_g_force_ema_step() {
        let mut pipeline = DerivedSignalPipeline::new();
        let mut sample = make_sample(0, 10.0, STANDARD_GRAVITY, 0.0, 0.0);
        let derived = pipeline.process(&mut sample);

        assert!((derived.g_long - EMA_ALPHA).abs() < 1e-12);
        assert_eq!(derived.g_lat, 0.0);
        assert!((derived.g_total - EMA_ALPHA).abs() < 1e-12);
        assert_eq!(derived.motion, MotionState::Accelerating);
    }

    #[test]
    fn test_motion_classification() {
        assert_eq!(classify_motion(true, 1.0, 1.0), MotionState::Stationary);
        assert_eq!(classify_motion(false, 0.05, 0.3), MotionState::Cornering);
        assert_eq!(classify_motion(false, -0.4, 0.1), MotionState::Braking);
        assert_eq!(classify_motion(false, 0.02, -0.01), MotionState::Cruising);
    }

    #[test]
    fn test_replay_is_deterministic_after_reset() {
        let mut pipeline = DerivedSignalPipeline::new();

        let mut first = drive_sequence();
        pipeline.process_ordered(&mut first);
        assert_eq!(pipeline.processed(), 40);

        pipeline.reset();
        assert_eq!(pipeline.state(), FilterState::default());

        let mut second = drive_sequence();
        pipeline.process_ordered(&mut second);

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.derived, b.derived);
        }
    }

    #[test]
    fn test_out_of_order_feed_changes_results() {
        let mut ordered = drive_sequence();
        let mut pipeline = DerivedSignalPipeline::new();
        pipeline.process_ordered(&mut ordered);

        let mut shuffled = drive_sequence();
        shuffled.swap(12, 30);
        let mut pipeline = DerivedSignalPipeline::new();
        pipeline.process_ordered(&mut shuffled);

        let last_ordered = ordered.last().unwrap().derived.unwrap();
        let last_shuffled = shuffled.last().unwrap().derived.unwrap();
        assert_ne!(last_ordered.g_long, last_shuffled.g_long);
    }
}
