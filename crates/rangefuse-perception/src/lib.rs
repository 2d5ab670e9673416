//! `rangefuse-perception` – the fusion core.
//!
//! Projects readings from narrow-beam range sensors into a panoramic scan.
//!
//! # Modules
//!
//! - [`transform`] – [`TfEngine`][transform::TfEngine]: tree of named
//!   reference frames that composes rigid transforms (translation +
//!   quaternion rotation) between any two of them.
//! - [`sensor`] – [`SensorDescriptor`][sensor::SensorDescriptor]: static
//!   configuration of one auxiliary sensor plus an atomically updated latest
//!   reading.
//! - [`fuser`] – [`ScanFuser`][fuser::ScanFuser]: builds the full-circle
//!   output scan and merges sensor points into it bin by bin.

pub mod fuser;
pub mod sensor;
pub mod transform;

pub use fuser::{ConeStrategy, MergePolicy, ScanFuser, SensorOutcome};
pub use sensor::{ReadingHandle, SensorDescriptor};
pub use transform::{LookupTime, SharedTfEngine, TfEngine, Transform3D, TransformProvider};
