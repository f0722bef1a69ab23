//! Run documents consumed by the writer.
//!
//! The orchestrator pushes documents of one run in lifecycle order
//! (start, descriptors and events, stop). See [`document`] for the types.

pub mod document;

pub use document::{
    DataKey, DescriptorDoc, DeviceConfiguration, Document, EventDoc, StartDoc, StopDoc,
    SCHEMA_KEY,
};
