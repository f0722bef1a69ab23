//! Schema-driven NeXus writer for run documents.
//!
//! The crate turns the documents of one acquisition run (start, descriptors,
//! events, stop) into a hierarchical output file whose layout is described by
//! one YAML schema per device. Leaf values in a schema are either literals or
//! placeholders naming where the value comes from:
//!
//! - `$pre-run-md:<path>`: the device's static metadata, read when the run starts
//! - `$pre-run-cpt:<path>`: a device component read when the run starts
//! - `$post-run[:<component>]`: the value the run's documents reported
//!
//! A [`materializer::RunMaterializer`] buffers the documents, resolves every
//! placeholder, applies optional transformations, coerces values to their
//! declared types and writes the tree to an [`sink::OutputSink`].
//!
//! ```no_run
//! use daq_nexus::device::DeviceRegistry;
//! use daq_nexus::materializer::{RunMaterializer, WriterOptions};
//! use daq_nexus::schema::{ContractRegistry, SchemaSet};
//! use daq_nexus::sink::JsonSink;
//! use std::sync::Arc;
//!
//! # fn main() -> daq_nexus::error::AppResult<()> {
//! let schemas = SchemaSet::load_dir("schemas", ContractRegistry::builtin())?;
//! let devices = DeviceRegistry::load_yaml("devices.yml")?;
//! let mut writer = RunMaterializer::new(
//!     Arc::new(schemas),
//!     devices,
//!     JsonSink::new(),
//!     WriterOptions::default(),
//! );
//! # let documents: Vec<daq_nexus::experiment::Document> = Vec::new();
//! for document in documents {
//!     if let Some(report) = writer.handle(document)? {
//!         println!("{} failed leaves", report.failures.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod coerce;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod materializer;
pub mod placeholder;
pub mod resolve;
pub mod schema;
pub mod sink;
pub mod transform;
pub mod value;
