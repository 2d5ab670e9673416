//! `rangefuse-middleware` – message transport.
//!
//! Routes scans, sensor readings, and frame updates between the outside
//! world and the fusion runtime without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Named-topic publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`stdio_bridge`] – Newline-delimited JSON bridge that feeds the bus from
//!   an input stream and writes a topic back out.

pub mod bus;
pub mod stdio_bridge;

pub use bus::{EventBus, TF_TOPIC, TopicReceiver};
pub use stdio_bridge::{BridgeFrame, StdioBridge};
