//! Largest-Triangle-Three-Buckets downsampling
//!
//! Reduces an ordered series to a fixed point count for charting while
//! keeping visual extrema and trend changes.

use crate::types::Sample;

/// Downsample `series` to `target` points using LTTB
///
/// `x_of` must be non-decreasing along the series. Input order is never
/// changed; first and last points are always kept. With `target < 3` the
/// first `target` points are returned.
pub fn lttb<T, X, Y>(series: &[T], target: usize, x_of: X, y_of: Y) -> Vec<T>
where
    T: Clone,
    X: Fn(&T) -> f64,
    Y: Fn(&T) -> f64,
{
    let len = series.len();
    if len <= target {
        return series.to_vec();
    }
    if target < 3 {
        return series[..target].to_vec();
    }

    // Shift x so areas stay well-conditioned for epoch-millisecond axes.
    let x0 = x_of(&series[0]);
    let x = |i: usize| x_of(&series[i]) - x0;
    let y = |i: usize| y_of(&series[i]);

    let every = (len - 2) as f64 / (target - 2) as f64;
    let mut sampled = Vec::with_capacity(target);
    sampled.push(series[0].clone());
    let mut a = 0usize;

    for bucket in 0..target - 2 {
        let avg_start = ((bucket + 1) as f64 * every).floor() as usize + 1;
        let avg_end = (((bucket + 2) as f64 * every).floor() as usize + 1).min(len);
        let avg_len = (avg_end - avg_start) as f64;
        let (mut avg_x, mut avg_y) = (0.0, 0.0);
        for j in avg_start..avg_end {
            avg_x += x(j);
            avg_y += y(j);
        }
        avg_x /= avg_len;
        avg_y /= avg_len;

        let range_start = (bucket as f64 * every).floor() as usize + 1;
        let range_end = ((bucket + 1) as f64 * every).floor() as usize + 1;

        let (ax, ay) = (x(a), y(a));
        let mut max_area = -1.0;
        let mut chosen = range_start;
        for j in range_start..range_end {
            let area = ((ax - avg_x) * (y(j) - ay) - (ax - x(j)) * (avg_y - ay)).abs() * 0.5;
            if area > max_area {
                max_area = area;
                chosen = j;
            }
        }

        sampled.push(series[chosen].clone());
        a = chosen;
    }

    sampled.push(series[len - 1].clone());
    sampled
}

/// Downsample samples against their timestamp axis
pub fn downsample<F>(series: &[Sample], target: usize, value_selector: F) -> Vec<Sample>
where
    F: Fn(&Sample) -> f64,
{
    lttb(
        series,
        target,
        |s| s.timestamp.timestamp_millis() as f64,
        value_selector,
    )
}
