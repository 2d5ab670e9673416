//! `rangefuse-types` – shared wire messages and errors.
//!
//! Every crate in the workspace speaks these types: the bus routes
//! [`Event`]s, the fuser consumes and produces [`RangeScan`]s, and all
//! fallible operations return [`FuseError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Distance stored in a bin that saw no return.
pub const NO_RETURN: f32 = f32::INFINITY;

/// A panoramic range scan (the shape of a ROS `sensor_msgs/LaserScan`).
///
/// `ranges[0]` is the sample at `angle_min`; sample `i` lies at
/// `angle_min + i * angle_increment`.  Bins without a return hold
/// [`NO_RETURN`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeScan {
    /// Coordinate frame the scan is expressed in, e.g. `"laser"`.
    pub frame_id: String,
    /// Capture time of the scan.
    pub timestamp: DateTime<Utc>,
    /// Angle of the first sample (radians).
    pub angle_min: f32,
    /// Angle of the last sample (radians).
    pub angle_max: f32,
    /// Angular distance between consecutive samples (radians).
    pub angle_increment: f32,
    /// Time between consecutive measurements (seconds).
    pub time_increment: f32,
    /// Time taken for one complete scan (seconds).
    pub scan_time: f32,
    /// Minimum valid distance (metres).
    pub range_min: f32,
    /// Maximum valid distance (metres).
    pub range_max: f32,
    /// One distance per angular bin (metres).  Serialised with `null` for
    /// bins that saw no return, since JSON has no infinity.  See
    /// [`no_return`] for what this does to `NaN` and `-∞`.
    #[serde(with = "no_return")]
    pub ranges: Vec<f32>,
}

impl RangeScan {
    /// Number of bins holding an actual return.
    pub fn returns(&self) -> usize {
        self.ranges.iter().filter(|r| r.is_finite()).count()
    }
}

/// A single scalar reading from a narrow-beam range sensor (sonar, IR, ToF).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeReading {
    pub timestamp: DateTime<Utc>,
    /// Measured distance along the sensor's boresight (metres).
    pub range: f32,
}

/// A timestamped rigid transform between two named frames.
///
/// Maps points expressed in `child_frame` into `parent_frame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStamped {
    pub parent_frame: String,
    pub child_frame: String,
    pub timestamp: DateTime<Utc>,
    /// Translation `[x, y, z]` in metres.
    pub translation: [f32; 3],
    /// Unit quaternion `[w, x, y, z]`.
    pub rotation: [f32; 4],
}

/// Unified event wrapper routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "rangefuse-middleware::stdio"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh event stamped with the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A panoramic scan, inbound or fused.
    Scan(RangeScan),
    /// A reading from one auxiliary range sensor.
    Range(RangeReading),
    /// A frame-tree update.
    Transform(TransformStamped),
}

/// Reasons a frame-to-frame transform could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformError {
    #[error("unknown frame '{0}'")]
    UnknownFrame(String),

    #[error("frames '{target_frame}' and '{source_frame}' are not connected")]
    Disconnected {
        target_frame: String,
        source_frame: String,
    },

    #[error("transform for '{frame}' unavailable at {requested} (latest is {latest})")]
    Extrapolation {
        frame: String,
        requested: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FuseError {
    #[error("Invalid scan geometry: {0}")]
    InvalidScanGeometry(String),

    #[error("Transform lookup failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

/// Serde adapter for range arrays: non-finite values travel as `null` and
/// come back as [`NO_RETURN`].
///
/// The encoding is lossy.  `NaN` (invalid measurement) and `-∞` (object
/// closer than `range_min`) both decode as `+∞`, so a consumer of the JSON
/// stream cannot tell them apart from "no return".  Inbound samples are
/// re-binned unchanged, so such values in a scan do reach the fused output
/// and are flattened only on the wire.
pub mod no_return {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NO_RETURN;

    pub fn serialize<S: Serializer>(ranges: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(ranges.iter().map(|r| r.is_finite().then_some(*r)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f32>, D::Error> {
        let raw: Vec<Option<f32>> = Vec::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|r| r.unwrap_or(NO_RETURN)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(ranges: Vec<f32>) -> RangeScan {
        RangeScan {
            frame_id: "laser".to_string(),
            timestamp: Utc::now(),
            angle_min: -1.0,
            angle_max: 1.0,
            angle_increment: 0.5,
            time_increment: 0.0,
            scan_time: 0.1,
            range_min: 0.1,
            range_max: 10.0,
            ranges,
        }
    }

    #[test]
    fn no_return_survives_json() {
        let s = scan(vec![1.5, NO_RETURN, 2.0]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("[1.5,null,2.0]"), "got {json}");

        let back: RangeScan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ranges[0], 1.5);
        assert!(back.ranges[1].is_infinite());
        assert_eq!(back.returns(), 2);
    }

    #[test]
    fn nan_and_negative_infinity_decode_as_no_return() {
        let s = scan(vec![f32::NAN, f32::NEG_INFINITY, 0.5]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("[null,null,0.5]"), "got {json}");

        let back: RangeScan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ranges[0], NO_RETURN);
        assert_eq!(back.ranges[1], NO_RETURN);
    }

    #[test]
    fn event_payload_is_tagged() {
        let event = Event::new(
            "test",
            EventPayload::Range(RangeReading {
                timestamp: Utc::now(),
                range: 0.75,
            }),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"range\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        match back.payload {
            EventPayload::Range(r) => assert!((r.range - 0.75).abs() < f32::EPSILON),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn transform_error_converts_into_fuse_error() {
        let err: FuseError = TransformError::UnknownFrame("sonar_9".to_string()).into();
        assert!(matches!(err, FuseError::Transform(_)));
        assert!(err.to_string().contains("sonar_9"));
    }

    #[test]
    fn disconnected_display_names_both_frames() {
        let err = TransformError::Disconnected {
            target_frame: "laser".to_string(),
            source_frame: "sonar_left".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("laser") && msg.contains("sonar_left"));
    }
}
