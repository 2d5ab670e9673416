//! [`FusionNode`] – wires a [`FusionManager`] to the [`EventBus`].
//!
//! The node subscribes to the inbound scan topic, to one topic per
//! registered sensor and to [`TF_TOPIC`].  Everything runs on a single task:
//! before each inbound scan is fused, pending sensor readings and frame
//! updates are drained from their receivers, so a reading published ahead of
//! a scan is always visible to that scan's fusion cycle.
//!
//! Draining takes *everything* buffered, including readings that arrived
//! after the scan being fused.  On a live feed that is the freshest data
//! available.  When a recorded stream is replayed faster than it is
//! consumed, scan *k* may be fused with readings stamped after it;
//! reading timestamps are not compared with the scan's.
//!
//! Fused scans are published on the output topic through a [`BusSink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rangefuse_middleware::{EventBus, TF_TOPIC, TopicReceiver};
use rangefuse_perception::{ReadingHandle, ScanFuser, SensorDescriptor, SharedTfEngine};
use rangefuse_types::{Event, EventPayload, FuseError, RangeScan};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};

use crate::manager::{FusionManager, ScanSink};

const SOURCE: &str = "rangefuse-runtime::node";

/// How long the scan loop waits before re-checking the shutdown flag.
const IDLE_POLL: Duration = Duration::from_millis(50);

// ────────────────────────────────────────────────────────────────────────────
// BusSink
// ────────────────────────────────────────────────────────────────────────────

/// [`ScanSink`] that publishes fused scans on a bus topic.
///
/// A topic nobody listens to is not an error; the scan is simply dropped.
pub struct BusSink {
    bus: EventBus,
    topic: String,
}

impl BusSink {
    pub fn new(bus: EventBus, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }
}

impl ScanSink for BusSink {
    fn publish(&mut self, scan: RangeScan) -> Result<(), FuseError> {
        match self
            .bus
            .publish_to(&self.topic, Event::new(SOURCE, EventPayload::Scan(scan)))
        {
            Ok(receivers) => {
                debug!(topic = %self.topic, receivers, "fused scan published");
                Ok(())
            }
            Err(FuseError::Channel(reason)) => {
                debug!(%reason, "fused scan dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionNode
// ────────────────────────────────────────────────────────────────────────────

/// Counters returned when [`FusionNode::run`] finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    /// Inbound scans fused and published.
    pub cycles: u64,
    /// Inbound scans rejected for invalid geometry or sink failure.
    pub rejected: u64,
}

pub struct FusionNode {
    bus: EventBus,
    manager: FusionManager,
    tf: SharedTfEngine,
    scans: TopicReceiver,
    tf_updates: TopicReceiver,
    readings: Vec<(TopicReceiver, ReadingHandle)>,
    stats: NodeStats,
}

impl FusionNode {
    /// Build a node that fuses scans from `input_topic` into `output_topic`.
    ///
    /// Subscriptions are taken here, so events published after construction
    /// are not lost even if [`run`](Self::run) starts later.
    pub fn new(
        bus: EventBus,
        tf: SharedTfEngine,
        fuser: ScanFuser,
        input_topic: &str,
        output_topic: &str,
    ) -> Self {
        let sink = BusSink::new(bus.clone(), output_topic);
        let manager = FusionManager::new(fuser, Box::new(tf.clone()), Box::new(sink));
        Self {
            scans: bus.subscribe_to(input_topic),
            tf_updates: bus.subscribe_to(TF_TOPIC),
            bus,
            manager,
            tf,
            readings: Vec::new(),
            stats: NodeStats::default(),
        }
    }

    /// Register a sensor and subscribe to its reading topic.
    pub fn add_sensor(&mut self, sensor: SensorDescriptor) {
        let rx = self.bus.subscribe_to(sensor.topic());
        let handle = self.manager.add_sensor(sensor);
        self.readings.push((rx, handle));
    }

    pub fn manager(&self) -> &FusionManager {
        &self.manager
    }

    /// Process inbound scans until `shutdown` is raised or the bus closes.
    ///
    /// Once `shutdown` is observed, scans already buffered are still fused
    /// before the loop exits.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> NodeStats {
        info!(
            input = %self.scans.topic(),
            sensors = self.manager.sensors().len(),
            "fusion node running"
        );

        loop {
            match tokio::time::timeout(IDLE_POLL, self.scans.recv()).await {
                Ok(Ok(event)) => self.handle_scan_event(event),
                Ok(Err(RecvError::Lagged(n))) => {
                    warn!(lagged_by = n, "fusion fell behind; inbound scans dropped");
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => self.drain_updates(),
            }

            if shutdown.load(Ordering::SeqCst) {
                while let Ok(event) = self.scans.try_recv() {
                    self.handle_scan_event(event);
                }
                break;
            }
        }

        info!(cycles = self.stats.cycles, rejected = self.stats.rejected, "fusion node stopped");
        self.stats
    }

    fn handle_scan_event(&mut self, event: Event) {
        let EventPayload::Scan(scan) = event.payload else {
            debug!(source = %event.source, "ignoring non-scan event on input topic");
            return;
        };

        self.drain_updates();
        match self.manager.on_inbound_scan(&scan) {
            Ok(report) => {
                self.stats.cycles += 1;
                debug!(
                    fused = report.fused,
                    out_of_limits = report.out_of_limits,
                    transform_failures = report.transform_failures,
                    "cycle report"
                );
            }
            Err(e) => {
                self.stats.rejected += 1;
                warn!(frame = %scan.frame_id, error = %e, "rejecting inbound scan");
            }
        }
    }

    /// Apply every buffered sensor reading and frame update, whatever its
    /// timestamp.
    fn drain_updates(&mut self) {
        for (rx, handle) in &mut self.readings {
            loop {
                match rx.try_recv() {
                    Ok(event) => match event.payload {
                        EventPayload::Range(reading) => handle.record(reading.range),
                        _ => debug!(topic = %rx.topic(), "ignoring non-range event on sensor topic"),
                    },
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }

        loop {
            match self.tf_updates.try_recv() {
                Ok(event) => match event.payload {
                    EventPayload::Transform(msg) => {
                        debug!(parent = %msg.parent_frame, child = %msg.child_frame, "frame update");
                        self.tf.update(|tf| tf.apply(&msg));
                    }
                    _ => debug!("ignoring non-transform event on tf topic"),
                },
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rangefuse_perception::{TfEngine, Transform3D};
    use rangefuse_types::{NO_RETURN, RangeReading, TransformStamped};
    use std::f32::consts::{FRAC_PI_2, PI};

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

    fn range_event(range: f32) -> Event {
        Event::new("test", EventPayload::Range(RangeReading { timestamp: Utc::now(), range }))
    }

    fn node_with(tf: TfEngine) -> (EventBus, FusionNode) {
        let bus = EventBus::default();
        let mut node = FusionNode::new(
            bus.clone(),
            SharedTfEngine::new(tf),
            ScanFuser::default(),
            "scan",
            "scan_fused",
        );
        node.add_sensor(SensorDescriptor::new("sonar/front", "sonar", 0.1, 5.0, 0.26));
        (bus, node)
    }

    fn stopped() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    async fn next_fused(rx: &mut TopicReceiver) -> RangeScan {
        match rx.recv().await.unwrap().payload {
            EventPayload::Scan(scan) => scan,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn reading_before_scan_is_fused() {
        let mut tf = TfEngine::new();
        tf.set_static_transform("laser", "sonar", Transform3D::identity());
        let (bus, node) = node_with(tf);
        let mut out = bus.subscribe_to("scan_fused");

        bus.publish_to("sonar/front", range_event(2.0)).unwrap();
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(inbound()))).unwrap();

        let stats = node.run(stopped()).await;
        assert_eq!(stats, NodeStats { cycles: 1, rejected: 0 });

        let fused = next_fused(&mut out).await;
        assert_eq!(fused.ranges.len(), 360);
        assert_eq!(fused.ranges[180], 2.0);
    }

    #[tokio::test]
    async fn buffered_reading_after_scan_is_applied_to_that_scan() {
        let mut tf = TfEngine::new();
        tf.set_static_transform("laser", "sonar", Transform3D::identity());
        let (bus, node) = node_with(tf);
        let mut out = bus.subscribe_to("scan_fused");

        let scan = inbound();
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(scan.clone()))).unwrap();
        let later = RangeReading {
            timestamp: scan.timestamp + chrono::TimeDelta::seconds(5),
            range: 3.0,
        };
        bus.publish_to("sonar/front", Event::new("test", EventPayload::Range(later))).unwrap();

        node.run(stopped()).await;
        assert_eq!(next_fused(&mut out).await.ranges[180], 3.0);
    }

    #[test]
    fn manager_lists_registered_sensors() {
        let (_bus, mut node) = node_with(TfEngine::new());
        node.add_sensor(SensorDescriptor::new("sonar/left", "sonar_left", 0.1, 5.0, 0.26));
        let listed: Vec<(&str, &str)> = node
            .manager()
            .sensors()
            .iter()
            .map(|s| (s.topic(), s.frame_id()))
            .collect();
        assert_eq!(listed, vec![("sonar/front", "sonar"), ("sonar/left", "sonar_left")]);
    }

    #[tokio::test]
    async fn frame_update_on_tf_topic_enables_sensor() {
        let (bus, node) = node_with(TfEngine::new());
        let mut out = bus.subscribe_to("scan_fused");

        let mount = TransformStamped {
            parent_frame: "laser".to_string(),
            child_frame: "sonar".to_string(),
            timestamp: Utc::now(),
            translation: [0.5, 0.0, 0.0],
            rotation: [1.0, 0.0, 0.0, 0.0],
        };
        bus.publish_to(TF_TOPIC, Event::new("test", EventPayload::Transform(mount))).unwrap();
        bus.publish_to("sonar/front", range_event(1.0)).unwrap();
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(inbound()))).unwrap();

        node.run(stopped()).await;

        let fused = next_fused(&mut out).await;
        assert!((fused.ranges[180] - 1.5).abs() < 1e-5);
    }

    #[tokio::test]
    async fn missing_frame_still_publishes_skeleton() {
        let (bus, node) = node_with(TfEngine::new());
        let mut out = bus.subscribe_to("scan_fused");

        bus.publish_to("sonar/front", range_event(2.0)).unwrap();
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(inbound()))).unwrap();

        let stats = node.run(stopped()).await;
        assert_eq!(stats.cycles, 1);
        assert_eq!(next_fused(&mut out).await.returns(), 0);
    }

    #[tokio::test]
    async fn invalid_scan_is_counted_as_rejected() {
        let (bus, node) = node_with(TfEngine::new());
        let mut bad = inbound();
        bad.angle_increment = -0.1;
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(bad))).unwrap();
        bus.publish_to("scan", Event::new("test", EventPayload::Scan(inbound()))).unwrap();

        let stats = node.run(stopped()).await;
        assert_eq!(stats, NodeStats { cycles: 1, rejected: 1 });
    }

    #[tokio::test]
    async fn idle_node_stops_when_flag_raised() {
        let (_bus, node) = node_with(TfEngine::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let handle = tokio::spawn(node.run(shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::SeqCst);

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("node did not stop")
            .unwrap();
        assert_eq!(stats, NodeStats::default());
    }

    #[test]
    fn bus_sink_without_subscribers_is_ok() {
        let mut sink = BusSink::new(EventBus::default(), "scan_fused");
        assert!(sink.publish(inbound()).is_ok());
    }
}
