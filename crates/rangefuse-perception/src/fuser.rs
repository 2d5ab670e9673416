//! Scan Fuser.
//!
//! Turns one inbound [`RangeScan`] plus the latest readings of every
//! auxiliary range sensor into a single full-circle fused scan:
//!
//! 1. [`ScanFuser::build_skeleton`] allocates a −π..π scan at the inbound
//!    angular resolution and re-bins every inbound sample into it.
//! 2. [`ScanFuser::fuse_sensor`] turns a sensor's reading into one or more
//!    points in the sensor frame, moves them into the scan frame, and hands
//!    each to [`ScanFuser::merge_point`].
//! 3. [`ScanFuser::merge_point`] converts a point to polar form and combines
//!    it with the bin it falls into.
//!
//! How samples are combined is explicit: the skeleton uses
//! [`MergePolicy::RawOverwrite`] and sensor points use
//! [`MergePolicy::ClosestWins`] unless configured otherwise.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use rangefuse_perception::fuser::ScanFuser;
//! use rangefuse_perception::sensor::SensorDescriptor;
//! use rangefuse_perception::transform::{TfEngine, Transform3D};
//! use rangefuse_types::RangeScan;
//!
//! let inbound = RangeScan {
//!     frame_id: "laser".to_string(),
//!     timestamp: Utc::now(),
//!     angle_min: -std::f32::consts::FRAC_PI_2,
//!     angle_max: std::f32::consts::FRAC_PI_2,
//!     angle_increment: std::f32::consts::PI / 180.0,
//!     time_increment: 0.0,
//!     scan_time: 0.1,
//!     range_min: 0.1,
//!     range_max: 10.0,
//!     ranges: vec![f32::INFINITY; 180],
//! };
//!
//! let mut tf = TfEngine::new();
//! tf.set_static_transform("laser", "sonar", Transform3D::identity());
//! let sonar = SensorDescriptor::new("sonar/front", "sonar", 0.1, 5.0, 0.26);
//! sonar.reading_handle().record(2.0);
//!
//! let fuser = ScanFuser::default();
//! let mut fused = fuser.build_skeleton(&inbound).unwrap();
//! fuser.fuse_sensor(&sonar, "laser", &tf, &mut fused);
//!
//! assert_eq!(fused.ranges.len(), 360);
//! assert_eq!(fused.ranges[180], 2.0);
//! ```

use std::f64::consts::{PI, TAU};

use rangefuse_types::{FuseError, NO_RETURN, RangeScan, TransformError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sensor::SensorDescriptor;
use crate::transform::{LookupTime, TransformProvider, Vec3};

/// Upper bound on the number of bins in a fused scan.
const MAX_BINS: usize = 1 << 20;

/// Most fan offsets taken on each side of a full cone.  Finer steps are
/// widened so the fan still reaches the cone edge.
pub const MAX_CONE_STEPS: u32 = 1024;

/// Smallest cone step accepted from configuration.
pub const MIN_CONE_STEP_RAD: f32 = 1e-4;

/// Bin positions within this many bins of an integer are treated as that
/// integer.  Scan fields are `f32`, so `2π / (π/180)` lands a few millionths
/// above 360.
const SNAP_EPSILON: f64 = 1e-4;

// ────────────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────────────

/// How a new sample is combined with the value already in its bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The newest sample replaces whatever the bin held.
    RawOverwrite,
    /// The nearer of the two distances is kept.
    #[default]
    ClosestWins,
}

impl MergePolicy {
    /// Combine `value` into `slot`.
    pub fn merge(self, slot: &mut f32, value: f32) {
        match self {
            MergePolicy::RawOverwrite => *slot = value,
            MergePolicy::ClosestWins => {
                if value < *slot {
                    *slot = value;
                }
            }
        }
    }
}

/// Which points of a sensor's cone are fused.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConeStrategy {
    /// Only the boresight point `(r, 0, 0)`.
    #[default]
    #[serde(rename = "central_ray")]
    CentralRayOnly,
    /// The boresight plus a fan of points `(r, ±tan(θ)·r, 0)` for
    /// `θ = step_rad, 2·step_rad, …` below the cone half-angle.
    ///
    /// The fan spans the whole `field_of_view`, not a quarter of it.  At most
    /// [`MAX_CONE_STEPS`] offsets are taken per side; a finer step is widened
    /// to `field_of_view / MAX_CONE_STEPS`.
    FullCone { step_rad: f32 },
}

impl ConeStrategy {
    /// Points in the sensor frame representing a reading of `range`.
    pub fn sample_points(self, range: f32, field_of_view: f32) -> Vec<Vec3> {
        let mut points = vec![Vec3::new(range, 0.0, 0.0)];
        let ConeStrategy::FullCone { step_rad } = self else {
            return points;
        };
        if !(step_rad > 0.0 && step_rad.is_finite() && field_of_view.is_finite()) {
            return points;
        }

        // tan() diverges at the cone edge of a hemispherical sensor.
        let limit = field_of_view.min(std::f32::consts::FRAC_PI_2 - 1e-3);
        let step = step_rad.max(limit / MAX_CONE_STEPS as f32);
        for k in 1..=MAX_CONE_STEPS {
            let theta = k as f32 * step;
            if theta >= limit {
                break;
            }
            let lateral = theta.tan() * range;
            points.push(Vec3::new(range, lateral, 0.0));
            points.push(Vec3::new(range, -lateral, 0.0));
        }
        points
    }
}

/// What happened to one sensor during a fusion cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorOutcome {
    /// The reading was projected; `merged` points landed inside the scan.
    Fused { merged: usize },
    /// The latest reading lies outside the sensor's valid interval.
    OutOfLimits,
    /// The sensor frame could not be related to the scan frame.
    TransformUnavailable(TransformError),
}

// ────────────────────────────────────────────────────────────────────────────
// ScanFuser
// ────────────────────────────────────────────────────────────────────────────

/// The fusion algorithm.  Stateless between cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanFuser {
    cone: ConeStrategy,
    skeleton_policy: MergePolicy,
    sensor_policy: MergePolicy,
}

impl Default for ScanFuser {
    fn default() -> Self {
        Self {
            cone: ConeStrategy::CentralRayOnly,
            skeleton_policy: MergePolicy::RawOverwrite,
            sensor_policy: MergePolicy::ClosestWins,
        }
    }
}

impl ScanFuser {
    pub fn new(cone: ConeStrategy, skeleton_policy: MergePolicy, sensor_policy: MergePolicy) -> Self {
        Self {
            cone,
            skeleton_policy,
            sensor_policy,
        }
    }

    /// Build the full-circle output scan from `inbound`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidScanGeometry`] when the inbound increment
    /// is zero, negative, or non-finite, when `angle_min` is non-finite, or
    /// when the resulting bin count is unreasonably large.
    pub fn build_skeleton(&self, inbound: &RangeScan) -> Result<RangeScan, FuseError> {
        if !inbound.angle_min.is_finite() {
            return Err(FuseError::InvalidScanGeometry(format!(
                "angle_min must be finite, got {}",
                inbound.angle_min
            )));
        }
        let angle_min = -std::f32::consts::PI;
        let angle_max = std::f32::consts::PI;
        let bins = bin_count(angle_min, angle_max, inbound.angle_increment)?;

        let mut output = RangeScan {
            frame_id: inbound.frame_id.clone(),
            timestamp: inbound.timestamp,
            angle_min,
            angle_max,
            angle_increment: inbound.angle_increment,
            time_increment: inbound.time_increment,
            scan_time: inbound.scan_time,
            range_min: inbound.range_min,
            range_max: inbound.range_max,
            ranges: vec![NO_RETURN; bins],
        };

        let start = f64::from(inbound.angle_min);
        let step = f64::from(inbound.angle_increment);
        for (i, &range) in inbound.ranges.iter().enumerate() {
            let angle = normalize_angle(start + i as f64 * step);
            match locate_bin(&output, angle) {
                Some(j) => self.skeleton_policy.merge(&mut output.ranges[j], range),
                None => debug!(index = i, angle, "inbound sample has no output bin"),
            }
        }

        Ok(output)
    }

    /// Project `sensor`'s latest reading into `scan`, which is expressed in
    /// `output_frame`.
    ///
    /// Never fails: an out-of-limits reading or a missing transform skips the
    /// sensor for this cycle and is reported in the returned
    /// [`SensorOutcome`].
    pub fn fuse_sensor(
        &self,
        sensor: &SensorDescriptor,
        output_frame: &str,
        transforms: &dyn TransformProvider,
        scan: &mut RangeScan,
    ) -> SensorOutcome {
        let range = sensor.last_range();
        if !sensor.in_limits() {
            info!(
                topic = %sensor.topic(),
                range,
                range_min = sensor.range_min(),
                range_max = sensor.range_max(),
                "sensor reading out of limits; skipping"
            );
            return SensorOutcome::OutOfLimits;
        }

        let transform = match transforms.lookup(output_frame, sensor.frame_id(), LookupTime::Latest) {
            Ok(t) => t,
            Err(e) => {
                warn!(topic = %sensor.topic(), frame = %sensor.frame_id(), error = %e, "tf error; skipping sensor");
                return SensorOutcome::TransformUnavailable(e);
            }
        };

        debug!(topic = %sensor.topic(), range, "fusing sensor reading");
        let mut merged = 0;
        for local in self.cone.sample_points(range, sensor.field_of_view()) {
            if self.merge_point(transform.transform_point(local), scan) {
                merged += 1;
            }
        }

        SensorOutcome::Fused { merged }
    }

    /// Merge a point expressed in the scan frame into `scan`.
    ///
    /// Returns `false` (and leaves `scan` untouched) when the point's bearing
    /// or distance lies outside what the scan can represent.
    pub fn merge_point(&self, point: Vec3, scan: &mut RangeScan) -> bool {
        let range = point.y.hypot(point.x);
        let angle = point.y.atan2(point.x);

        let in_envelope = angle >= scan.angle_min
            && angle <= scan.angle_max
            && range >= scan.range_min
            && range <= scan.range_max;

        match locate_bin(scan, f64::from(angle)).filter(|_| in_envelope) {
            Some(index) => {
                self.sensor_policy.merge(&mut scan.ranges[index], range);
                true
            }
            None => {
                debug!(angle, range, "point outside scan envelope; dropped");
                false
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bin arithmetic
// ────────────────────────────────────────────────────────────────────────────

fn snap(x: f64) -> f64 {
    let nearest = x.round();
    if (x - nearest).abs() < SNAP_EPSILON { nearest } else { x }
}

/// Wrap an angle into `[-π, π]`.
fn normalize_angle(angle: f64) -> f64 {
    if (-PI..=PI).contains(&angle) {
        angle
    } else {
        (angle + PI).rem_euclid(TAU) - PI
    }
}

fn spans_full_circle(scan: &RangeScan) -> bool {
    f64::from(scan.angle_max) - f64::from(scan.angle_min) >= TAU - 1e-5
}

/// `ceil((angle_max - angle_min) / angle_increment)`, validated.
pub fn bin_count(angle_min: f32, angle_max: f32, angle_increment: f32) -> Result<usize, FuseError> {
    let increment = f64::from(angle_increment);
    if !increment.is_finite() || increment <= 0.0 {
        return Err(FuseError::InvalidScanGeometry(format!(
            "angle_increment must be positive and finite, got {angle_increment}"
        )));
    }
    let span = f64::from(angle_max) - f64::from(angle_min);
    if !span.is_finite() || span < 0.0 {
        return Err(FuseError::InvalidScanGeometry(format!(
            "invalid angular span [{angle_min}, {angle_max}]"
        )));
    }

    let bins = snap(span / increment).ceil();
    if bins > MAX_BINS as f64 {
        return Err(FuseError::InvalidScanGeometry(format!(
            "{bins} bins exceeds the limit of {MAX_BINS}"
        )));
    }
    Ok(bins as usize)
}

/// Index of the bin containing `angle`, or `None` if it has none.
///
/// The lower edge is inclusive.  The upper edge maps to bin 0 on a
/// full-circle scan (π and −π are the same bearing) and to the last bin
/// otherwise.
fn locate_bin(scan: &RangeScan, angle: f64) -> Option<usize> {
    let len = scan.ranges.len();
    if len == 0 {
        return None;
    }
    let offset = snap((angle - f64::from(scan.angle_min)) / f64::from(scan.angle_increment)).floor();
    if !offset.is_finite() || offset < 0.0 {
        return None;
    }

    let index = offset as usize;
    if index < len {
        Some(index)
    } else if index == len {
        Some(if spans_full_circle(scan) { 0 } else { len - 1 })
    } else {
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
