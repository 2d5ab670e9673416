//! `rangefuse-runtime` – the fusion node.
//!
//! # Modules
//!
//! - [`manager`] – [`FusionManager`][manager::FusionManager]: owns the
//!   registered sensors and runs one fusion cycle per inbound scan, handing
//!   the result to a [`ScanSink`][manager::ScanSink].
//! - [`node`] – [`FusionNode`][node::FusionNode]: drives the manager from
//!   the event bus, applying sensor readings and frame updates as they arrive
//!   and publishing fused scans on the output topic.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.

pub mod manager;
pub mod node;
pub mod telemetry;

pub use manager::{CycleReport, FusionManager, ScanSink};
pub use node::{BusSink, FusionNode, NodeStats};
pub use telemetry::{TracerProviderGuard, init_tracing};
