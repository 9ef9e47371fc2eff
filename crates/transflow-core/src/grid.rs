//! Time grids.
//!
//! A grid is a non-empty, strictly increasing sequence of timepoints. States,
//! controls and constraints each live on their own grid; the helpers here
//! build grids from the usual start/step/end descriptions and locate a time
//! inside a grid for piecewise-linear interpolation.

use serde::{Deserialize, Serialize};

use crate::error::{TransflowError, TransflowResult};

/// Tolerance used for every time comparison that crosses grids.
pub const EPSILON: f64 = 1e-10;

/// Grid description as it appears in configuration files.
///
/// The step actually used is recomputed so that the last point hits `end`
/// exactly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub start: f64,
    pub end: f64,
    pub desired_delta: f64,
}

impl GridSpec {
    pub fn points(&self) -> TransflowResult<Vec<f64>> {
        from_start_delta_end(self.start, self.desired_delta, self.end)
    }
}

/// `number` points starting at `start`, spaced `delta` apart.
pub fn from_start_delta_number(start: f64, delta: f64, number: usize) -> TransflowResult<Vec<f64>> {
    if number == 0 {
        return Err(TransflowError::InvalidGrid(
            "number of points must be positive".to_string(),
        ));
    }
    if !(delta > 0.0) {
        return Err(TransflowError::InvalidGrid(format!(
            "delta must be positive, got {delta}"
        )));
    }
    Ok((0..number).map(|i| start + i as f64 * delta).collect())
}

/// Evenly spaced points from `start` to `end` with a step no larger than
/// `desired_delta`.
pub fn from_start_delta_end(start: f64, desired_delta: f64, end: f64) -> TransflowResult<Vec<f64>> {
    if !(end > start) {
        return Err(TransflowError::InvalidGrid(format!(
            "end time {end} must be larger than start time {start}"
        )));
    }
    if !(desired_delta > 0.0) {
        return Err(TransflowError::InvalidGrid(format!(
            "desired delta must be positive, got {desired_delta}"
        )));
    }
    let number = ((end - start) / desired_delta).ceil() as usize + 1;
    from_start_number_end(start, number, end)
}

/// `number` evenly spaced points from `start` to `end`, both included.
pub fn from_start_number_end(start: f64, number: usize, end: f64) -> TransflowResult<Vec<f64>> {
    if number < 2 {
        return Err(TransflowError::InvalidGrid(format!(
            "at least two points are needed to span [{start}, {end}], got {number}"
        )));
    }
    if !(end > start) {
        return Err(TransflowError::InvalidGrid(format!(
            "end time {end} must be larger than start time {start}"
        )));
    }
    let delta = (end - start) / (number - 1) as f64;
    let mut points: Vec<f64> = (0..number).map(|i| start + i as f64 * delta).collect();
    // Pin the end point against accumulated rounding.
    points[number - 1] = end;
    Ok(points)
}

/// Checks that `points` is non-empty and strictly increasing.
pub fn validate_points(points: &[f64]) -> TransflowResult<()> {
    if points.is_empty() {
        return Err(TransflowError::InvalidGrid(
            "a grid needs at least one point".to_string(),
        ));
    }
    if let Some(pos) = points.windows(2).position(|w| !(w[0] < w[1])) {
        return Err(TransflowError::InvalidGrid(format!(
            "points must be strictly increasing, but point {} ({}) is followed by {}",
            pos,
            points[pos],
            points[pos + 1]
        )));
    }
    Ok(())
}

/// Whether `outer` spans at least the interval of `inner`, up to [`EPSILON`].
pub fn span_covers(outer: &[f64], inner: &[f64]) -> bool {
    match (outer.first(), outer.last(), inner.first(), inner.last()) {
        (Some(&of), Some(&ol), Some(&inf), Some(&inl)) => {
            of <= inf + EPSILON && ol >= inl - EPSILON
        }
        _ => false,
    }
}

/// Position of `time` inside `points` as `(upper_index, lambda)`.
///
/// The interpolated value is `lambda * v[upper] + (1 - lambda) * v[upper - 1]`.
/// `lambda == 1.0` means the time sits on node `upper` (or was clamped to a
/// boundary node) and `v[upper - 1]` does not contribute.
pub fn locate(points: &[f64], time: f64) -> TransflowResult<(usize, f64)> {
    let (first, last) = match (points.first(), points.last()) {
        (Some(&first), Some(&last)) => (first, last),
        _ => {
            return Err(TransflowError::InvalidGrid(
                "cannot locate a time in an empty grid".to_string(),
            ))
        }
    };

    if time >= last {
        if time > last + EPSILON {
            return Err(TransflowError::OutOfRange { time, first, last });
        }
        return Ok((points.len() - 1, 1.0));
    }
    if time <= first {
        if time < first - EPSILON {
            return Err(TransflowError::OutOfRange { time, first, last });
        }
        return Ok((0, 1.0));
    }
    if time.is_nan() {
        return Err(TransflowError::OutOfRange { time, first, last });
    }

    let upper = points.partition_point(|&p| p < time);
    if points[upper] == time {
        return Ok((upper, 1.0));
    }
    let lower_time = points[upper - 1];
    let lambda = (time - lower_time) / (points[upper] - lower_time);
    Ok((upper, lambda))
}
