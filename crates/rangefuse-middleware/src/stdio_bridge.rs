//! Newline-delimited JSON bridge between a byte stream and the [`EventBus`].
//!
//! Each line is one [`BridgeFrame`]:
//!
//! ```json
//! {"topic":"scan","payload":{"kind":"scan","data":{ … }}}
//! {"topic":"sonar/front","payload":{"kind":"range","data":{"timestamp":"…","range":0.8}}}
//! ```
//!
//! [`StdioBridge::run_reader`] parses inbound lines and publishes them onto
//! the bus; [`StdioBridge::run_writer`] serialises everything arriving on one
//! topic back out.  Ranges without a return are written as `null`.
//!
//! The bridge is agnostic about the *meaning* of the data it routes; it only
//! handles serialisation and transport.

use rangefuse_types::{Event, EventPayload, FuseError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::{EventBus, TopicReceiver};

const SOURCE: &str = "rangefuse-middleware::stdio";

/// One line of bridge traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeFrame {
    pub topic: String,
    pub payload: EventPayload,
}

/// Bridge between a JSON-lines stream and the internal [`EventBus`].
#[derive(Clone, Debug)]
pub struct StdioBridge {
    bus: EventBus,
}

impl StdioBridge {
    /// Create a new bridge backed by `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Parse one JSON line and publish it on its topic.
    ///
    /// # Errors
    ///
    /// [`FuseError::Serialization`] for malformed lines and
    /// [`FuseError::Channel`] when nobody listens on the frame's topic.
    pub fn ingest_line(&self, line: &str) -> Result<usize, FuseError> {
        let frame: BridgeFrame = serde_json::from_str(line)
            .map_err(|e| FuseError::Serialization(format!("invalid bridge frame: {e}")))?;
        self.bus.publish_to(&frame.topic, Event::new(SOURCE, frame.payload))
    }

    /// Forward every line of `reader` onto the bus until end of input.
    ///
    /// Malformed lines and frames for topics without subscribers are logged
    /// and skipped.  Returns the number of frames delivered.
    pub async fn run_reader<R: AsyncBufRead + Unpin>(&self, reader: R) -> Result<usize, FuseError> {
        let mut lines = reader.lines();
        let mut forwarded = 0;

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| FuseError::Serialization(format!("input read error: {e}")))?
        {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.ingest_line(line) {
                Ok(_) => forwarded += 1,
                Err(FuseError::Channel(reason)) => debug!(%reason, "frame not delivered"),
                Err(e) => warn!(error = %e, "dropping bridge frame"),
            }
        }

        debug!(forwarded, "input stream closed");
        Ok(forwarded)
    }

    /// Write every event received on `rx` to `writer` as a JSON line, until
    /// the bus shuts down.  Returns the number of lines written.
    pub async fn run_writer<W: AsyncWrite + Unpin>(
        mut rx: TopicReceiver,
        mut writer: W,
    ) -> Result<usize, FuseError> {
        let mut written = 0;

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let frame = BridgeFrame {
                        topic: rx.topic().to_string(),
                        payload: event.payload,
                    };
                    let mut json = serde_json::to_string(&frame)
                        .map_err(|e| FuseError::Serialization(e.to_string()))?;
                    json.push('\n');
                    writer
                        .write_all(json.as_bytes())
                        .await
                        .map_err(|e| FuseError::Serialization(format!("output write error: {e}")))?;
                    writer
                        .flush()
                        .await
                        .map_err(|e| FuseError::Serialization(format!("output flush error: {e}")))?;
                    written += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %rx.topic(), lagged_by = n, "bridge writer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rangefuse_types::{NO_RETURN, RangeScan};

    const RANGE_LINE: &str =
        r#"{"topic":"sonar/front","payload":{"kind":"range","data":{"timestamp":"2024-01-01T00:00:00Z","range":0.8}}}"#;

    #[tokio::test]
    async fn ingest_line_publishes_on_frame_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to("sonar/front");
        let bridge = StdioBridge::new(bus);

        assert_eq!(bridge.ingest_line(RANGE_LINE)?, 1);
        let event = rx.recv().await?;
        assert_eq!(event.source, SOURCE);
        match event.payload {
            EventPayload::Range(r) => assert!((r.range - 0.8).abs() < 1e-6),
            other => panic!("unexpected payload {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn malformed_line_is_a_serialization_error() {
        let bridge = StdioBridge::new(EventBus::default());
        assert!(matches!(
            bridge.ingest_line("{not json"),
            Err(FuseError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn reader_skips_bad_lines() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let _rx = bus.subscribe_to("sonar/front");
        let bridge = StdioBridge::new(bus);

        let input = format!("{RANGE_LINE}\n\ngarbage\n{RANGE_LINE}\n");
        let forwarded = bridge.run_reader(input.as_bytes()).await?;
        assert_eq!(forwarded, 2);
        Ok(())
    }

    #[tokio::test]
    async fn writer_emits_json_lines_until_closed() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let rx = bus.subscribe_to("scan_fused");

        let scan = RangeScan {
            frame_id: "laser".to_string(),
            timestamp: Utc::now(),
            angle_min: -1.0,
            angle_max: 1.0,
            angle_increment: 1.0,
            time_increment: 0.0,
            scan_time: 0.1,
            range_min: 0.1,
            range_max: 10.0,
            ranges: vec![NO_RETURN, 1.25],
        };
        bus.publish_to("scan_fused", Event::new("test", EventPayload::Scan(scan)))?;
        drop(bus);

        let mut out: Vec<u8> = Vec::new();
        let written = StdioBridge::run_writer(rx, &mut out).await?;
        assert_eq!(written, 1);

        let text = String::from_utf8(out)?;
        assert!(text.ends_with('\n'));
        let frame: BridgeFrame = serde_json::from_str(text.trim())?;
        assert_eq!(frame.topic, "scan_fused");
        assert!(text.contains("[null,1.25]"), "got {text}");
        Ok(())
    }
}
