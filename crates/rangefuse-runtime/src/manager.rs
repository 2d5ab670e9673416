//! [`FusionManager`] – owns the auxiliary sensors and drives one fusion
//! cycle per inbound scan.
//!
//! The manager never reaches for globals: the transform lookup and the
//! outbound transport are handed to it at construction as a
//! [`TransformProvider`] and a [`ScanSink`].
//!
//! # Example
//!
//! ```rust
//! use rangefuse_perception::{ScanFuser, SensorDescriptor, TfEngine, Transform3D};
//! use rangefuse_runtime::manager::{FusionManager, ScanSink};
//! use rangefuse_types::{FuseError, RangeScan};
//!
//! struct Discard;
//! impl ScanSink for Discard {
//!     fn publish(&mut self, _scan: RangeScan) -> Result<(), FuseError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut tf = TfEngine::new();
//! tf.set_static_transform("laser", "sonar_front", Transform3D::identity());
//!
//! let mut manager = FusionManager::new(ScanFuser::default(), Box::new(tf), Box::new(Discard));
//! let reading = manager.add_sensor(SensorDescriptor::new("sonar/front", "sonar_front", 0.1, 5.0, 0.26));
//! reading.record(1.2);
//! assert_eq!(manager.sensors().len(), 1);
//! ```

use rangefuse_perception::{
    ReadingHandle, ScanFuser, SensorDescriptor, SensorOutcome, TransformProvider,
};
use rangefuse_types::{FuseError, RangeScan};
use tracing::debug;

/// Destination for fused scans.
pub trait ScanSink: Send {
    /// Emit one fused scan.
    fn publish(&mut self, scan: RangeScan) -> Result<(), FuseError>;
}

/// Per-cycle tally of what happened to each sensor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Sensors whose reading was projected into the scan.
    pub fused: usize,
    /// Sensors skipped because their reading was out of limits.
    pub out_of_limits: usize,
    /// Sensors skipped because their frame could not be resolved.
    pub transform_failures: usize,
}

/// Orchestrates descriptor ownership and per-message fusion.
pub struct FusionManager {
    fuser: ScanFuser,
    sensors: Vec<SensorDescriptor>,
    transforms: Box<dyn TransformProvider>,
    sink: Box<dyn ScanSink>,
}

impl FusionManager {
    pub fn new(fuser: ScanFuser, transforms: Box<dyn TransformProvider>, sink: Box<dyn ScanSink>) -> Self {
        Self {
            fuser,
            sensors: Vec::new(),
            transforms,
            sink,
        }
    }

    /// Register a sensor and return the handle that updates its reading.
    ///
    /// Sensors are fused in registration order; duplicates are not detected.
    pub fn add_sensor(&mut self, sensor: SensorDescriptor) -> ReadingHandle {
        let handle = sensor.reading_handle();
        self.sensors.push(sensor);
        handle
    }

    /// Registered sensors, in registration order.
    pub fn sensors(&self) -> &[SensorDescriptor] {
        &self.sensors
    }

    /// Run one fusion cycle without publishing.
    ///
    /// # Errors
    ///
    /// [`FuseError::InvalidScanGeometry`] when `inbound` cannot be binned.
    /// Per-sensor problems never fail the cycle; they are counted in the
    /// returned [`CycleReport`].
    pub fn fuse(&self, inbound: &RangeScan) -> Result<(RangeScan, CycleReport), FuseError> {
        let mut output = self.fuser.build_skeleton(inbound)?;
        let mut report = CycleReport::default();

        for sensor in &self.sensors {
            match self
                .fuser
                .fuse_sensor(sensor, &inbound.frame_id, self.transforms.as_ref(), &mut output)
            {
                SensorOutcome::Fused { .. } => report.fused += 1,
                SensorOutcome::OutOfLimits => report.out_of_limits += 1,
                SensorOutcome::TransformUnavailable(_) => report.transform_failures += 1,
            }
        }

        Ok((output, report))
    }

    /// Fuse `inbound` with every registered sensor and publish the result.
    ///
    /// # Errors
    ///
    /// Rejects scans with invalid geometry (nothing is published) and
    /// propagates sink failures.
    pub fn on_inbound_scan(&mut self, inbound: &RangeScan) -> Result<CycleReport, FuseError> {
        let (fused, report) = self.fuse(inbound)?;
        debug!(
            frame = %fused.frame_id,
            bins = fused.ranges.len(),
            fused = report.fused,
            skipped = report.out_of_limits + report.transform_failures,
            "fusion cycle complete"
        );
        self.sink.publish(fused)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rangefuse_perception::transform::{LookupTime, Quaternion, TfEngine, Transform3D, Vec3};
    use rangefuse_types::{NO_RETURN, TransformError};
    use std::f32::consts::{FRAC_PI_2, PI};
    use std::sync::{Arc, Mutex};

    /// Records every published scan.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<RangeScan>>>);

    impl ScanSink for RecordingSink {
        fn publish(&mut self, scan: RangeScan) -> Result<(), FuseError> {
            self.0.lock().unwrap().push(scan);
            Ok(())
        }
    }

    struct FailingTransforms;

    impl TransformProvider for FailingTransforms {
        fn lookup(&self, target: &str, source: &str, _: LookupTime) -> Result<Transform3D, TransformError> {
            Err(TransformError::Disconnected {
                target_frame: target.to_string(),
                source_frame: source.to_string(),
            })
        }
    }

    fn inbound() -> RangeScan {
        RangeScan {
            frame_id: "laser".to_string(),
            timestamp: Utc::now(),
            angle_min: -FRAC_PI_2,
            angle_max: FRAC_PI_2,
            angle_increment: PI / 180.0,
            time_increment: 0.0,
            scan_time: 0.1,
            range_min: 0.1,
            range_max: 10.0,
            ranges: vec![NO_RETURN; 180],
        }
    }

    fn sonar(frame: &str) -> SensorDescriptor {
        SensorDescriptor::new(format!("sonar/{frame}"), frame, 0.1, 5.0, 0.26)
    }

    fn manager_with(transforms: Box<dyn TransformProvider>) -> (FusionManager, RecordingSink) {
        let sink = RecordingSink::default();
        let manager = FusionManager::new(ScanFuser::default(), transforms, Box::new(sink.clone()));
        (manager, sink)
    }

    fn mounted(frames: &[(&str, Transform3D)]) -> Box<TfEngine> {
        let mut tf = TfEngine::new();
        for (frame, t) in frames {
            tf.set_static_transform("laser", frame, *t);
        }
        Box::new(tf)
    }

    #[test]
    fn single_sonar_end_to_end() {
        let (mut manager, sink) = manager_with(mounted(&[("sonar", Transform3D::identity())]));
        manager.add_sensor(sonar("sonar")).record(2.0);

        let report = manager.on_inbound_scan(&inbound()).unwrap();
        assert_eq!(report.fused, 1);

        let published = sink.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        let fused = &published[0];
        assert_eq!(fused.ranges.len(), 360);
        assert_eq!(fused.ranges[180], 2.0);
        assert_eq!(fused.returns(), 1);
    }

    #[test]
    fn transform_failure_publishes_skeleton() {
        let (mut manager, sink) = manager_with(Box::new(FailingTransforms));
        manager.add_sensor(sonar("sonar")).record(2.0);

        let report = manager.on_inbound_scan(&inbound()).unwrap();
        assert_eq!(report.transform_failures, 1);

        let skeleton = ScanFuser::default().build_skeleton(&inbound()).unwrap();
        let published = sink.0.lock().unwrap();
        assert_eq!(published[0].ranges, skeleton.ranges);
    }

    #[test]
    fn out_of_limits_sensor_is_counted_not_fused() {
        let (mut manager, sink) = manager_with(mounted(&[("sonar", Transform3D::identity())]));
        manager.add_sensor(sonar("sonar")).record(7.5);

        let report = manager.on_inbound_scan(&inbound()).unwrap();
        assert_eq!(report.out_of_limits, 1);
        assert_eq!(sink.0.lock().unwrap()[0].returns(), 0);
    }

    #[test]
    fn one_failing_sensor_does_not_block_others() {
        // Only "good" is in the frame tree.
        let (mut manager, sink) = manager_with(mounted(&[("good", Transform3D::identity())]));
        manager.add_sensor(sonar("missing")).record(1.0);
        manager.add_sensor(sonar("good")).record(3.0);

        let report = manager.on_inbound_scan(&inbound()).unwrap();
        assert_eq!(report, CycleReport { fused: 1, out_of_limits: 0, transform_failures: 1 });
        assert_eq!(sink.0.lock().unwrap()[0].ranges[180], 3.0);
    }

    #[test]
    fn invalid_scan_is_rejected_and_not_published() {
        let (mut manager, sink) = manager_with(mounted(&[]));
        let mut bad = inbound();
        bad.angle_increment = 0.0;

        assert!(matches!(
            manager.on_inbound_scan(&bad),
            Err(FuseError::InvalidScanGeometry(_))
        ));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn registration_order_does_not_change_output() {
        let left = Transform3D::new(Vec3::new(0.0, 0.2, 0.0), Quaternion::from_yaw(FRAC_PI_2));
        let front = Transform3D::new(Vec3::new(0.1, 0.0, 0.0), Quaternion::identity());
        let frames = [("left", left), ("front", front), ("front_b", front)];
        let readings = [("left", 0.8), ("front", 1.4), ("front_b", 0.9)];

        let (mut forward, _) = manager_with(mounted(&frames));
        for (frame, r) in readings {
            forward.add_sensor(sonar(frame)).record(r);
        }
        let (mut reverse, _) = manager_with(mounted(&frames));
        for (frame, r) in readings.iter().rev() {
            reverse.add_sensor(sonar(frame)).record(*r);
        }

        let (a, _) = forward.fuse(&inbound()).unwrap();
        let (b, _) = reverse.fuse(&inbound()).unwrap();
        assert_eq!(a.ranges, b.ranges);
        // front (1.5 m) and front_b (1.0 m) share a bin; the nearer wins.
        assert!((a.ranges[180] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn sensors_listed_in_registration_order() {
        let (mut manager, _) = manager_with(mounted(&[]));
        manager.add_sensor(sonar("a"));
        manager.add_sensor(sonar("b"));
        let topics: Vec<&str> = manager.sensors().iter().map(|s| s.topic()).collect();
        assert_eq!(topics, vec!["sonar/a", "sonar/b"]);
    }
}
