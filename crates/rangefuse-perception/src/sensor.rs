//! Auxiliary range sensors (sonar, IR, ToF) and their latest readings.
//!
//! A [`SensorDescriptor`] holds a sensor's static configuration and a shared
//! cell containing its most recent reading.  The cell is written through a
//! [`ReadingHandle`] by exactly one update path and read by the fusion cycle;
//! the reading is stored as the bit pattern of an `f32` in an atomic so a
//! reader never observes a torn value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Static configuration and latest reading of one auxiliary range sensor.
#[derive(Debug)]
pub struct SensorDescriptor {
    topic: String,
    frame_id: String,
    range_min: f32,
    range_max: f32,
    /// Half-angle of the sensing cone (radians).
    field_of_view: f32,
    reading: Arc<AtomicU32>,
}

impl SensorDescriptor {
    /// Create a descriptor with no reading yet.
    ///
    /// Until the first reading arrives the sensor is out of limits and is
    /// skipped by fusion.
    pub fn new(
        topic: impl Into<String>,
        frame_id: impl Into<String>,
        range_min: f32,
        range_max: f32,
        field_of_view: f32,
    ) -> Self {
        Self {
            topic: topic.into(),
            frame_id: frame_id.into(),
            range_min,
            range_max,
            field_of_view,
            reading: Arc::new(AtomicU32::new(f32::NAN.to_bits())),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    pub fn range_min(&self) -> f32 {
        self.range_min
    }

    pub fn range_max(&self) -> f32 {
        self.range_max
    }

    pub fn field_of_view(&self) -> f32 {
        self.field_of_view
    }

    /// Most recent reading, or `NaN` when none has arrived.
    pub fn last_range(&self) -> f32 {
        f32::from_bits(self.reading.load(Ordering::Acquire))
    }

    /// Whether the latest reading lies within `[range_min, range_max]`.
    pub fn in_limits(&self) -> bool {
        let range = self.last_range();
        range >= self.range_min && range <= self.range_max
    }

    /// Writer for this sensor's reading.  Hand it to the single task that
    /// ingests the sensor's topic.
    pub fn reading_handle(&self) -> ReadingHandle {
        ReadingHandle {
            reading: Arc::clone(&self.reading),
        }
    }
}

/// Write side of a [`SensorDescriptor`]'s reading cell.
#[derive(Debug, Clone)]
pub struct ReadingHandle {
    reading: Arc<AtomicU32>,
}

impl ReadingHandle {
    /// Publish a new reading.
    pub fn record(&self, range: f32) {
        self.reading.store(range.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sonar() -> SensorDescriptor {
        SensorDescriptor::new("sonar/front", "sonar_front", 0.1, 5.0, 0.26)
    }

    #[test]
    fn fresh_descriptor_is_out_of_limits() {
        let s = sonar();
        assert!(s.last_range().is_nan());
        assert!(!s.in_limits());
    }

    #[test]
    fn handle_updates_descriptor() {
        let s = sonar();
        s.reading_handle().record(2.0);
        assert!((s.last_range() - 2.0).abs() < f32::EPSILON);
        assert!(s.in_limits());
    }

    #[test]
    fn limits_are_inclusive() {
        let s = sonar();
        let h = s.reading_handle();
        h.record(0.1);
        assert!(s.in_limits());
        h.record(5.0);
        assert!(s.in_limits());
        h.record(5.01);
        assert!(!s.in_limits());
        h.record(0.05);
        assert!(!s.in_limits());
        h.record(f32::INFINITY);
        assert!(!s.in_limits());
    }

    #[test]
    fn reading_visible_across_threads() {
        let s = sonar();
        let h = s.reading_handle();
        std::thread::spawn(move || h.record(3.5)).join().unwrap();
        assert!((s.last_range() - 3.5).abs() < f32::EPSILON);
    }
}
