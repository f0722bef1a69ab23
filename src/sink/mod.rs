//! Output sinks: the hierarchical container a run is materialized into.
//!
//! A sink is a long-lived writer that is opened once per run, receives
//! group, dataset and attribute creation calls in tree order, and is closed
//! when the run's tree is complete. Handles returned by the create calls are
//! only valid until the next `open`.
//!
//! Three backends are provided:
//!
//! - [`MemorySink`]: keeps the tree in memory; used for dry runs and tests.
//! - [`JsonSink`]: builds the tree in memory and writes it as JSON on close.
//! - [`Hdf5Sink`]: writes an HDF5 file (requires the `storage_hdf5` feature).

mod hdf5_sink;
mod json;
mod memory;

pub use hdf5_sink::Hdf5Sink;
pub use json::JsonSink;
pub use memory::{MemoryNode, MemorySink, NodeKind};

use crate::coerce::TypedValue;
use crate::error::SinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Handle of a group or dataset inside an open sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

impl NodeId {
    /// The root group of the container.
    pub const ROOT: NodeId = NodeId(0);
}

pub trait OutputSink {
    /// Start a new container at `path` and return its root group.
    fn open(&mut self, path: &Path) -> Result<NodeId, SinkError>;

    fn create_group(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SinkError>;

    fn create_dataset(
        &mut self,
        parent: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<NodeId, SinkError>;

    /// Attach an attribute to a group or dataset. Names are unique per node.
    fn set_attribute(&mut self, node: NodeId, name: &str, value: &TypedValue)
        -> Result<(), SinkError>;

    /// Flush and release the container.
    fn close(&mut self) -> Result<(), SinkError>;
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn open(&mut self, path: &Path) -> Result<NodeId, SinkError> {
        (**self).open(path)
    }

    fn create_group(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SinkError> {
        (**self).create_group(parent, name)
    }

    fn create_dataset(
        &mut self,
        parent: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<NodeId, SinkError> {
        (**self).create_dataset(parent, name, value)
    }

    fn set_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<(), SinkError> {
        (**self).set_attribute(node, name, value)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// Output backend selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Json,
    Hdf5,
    Memory,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Json, Backend::Hdf5, Backend::Memory];

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Json => "json",
            Backend::Hdf5 => "hdf5",
            Backend::Memory => "memory",
        }
    }

    /// Construct a fresh sink for this backend.
    pub fn create_sink(self) -> Box<dyn OutputSink> {
        match self {
            Backend::Json => Box::new(JsonSink::new()),
            Backend::Hdf5 => Box::new(Hdf5Sink::new()),
            Backend::Memory => Box::new(MemorySink::new()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|backend| backend.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Unknown backend '{}'. Must be one of: json, hdf5, memory",
                    s
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("json".parse::<Backend>().unwrap(), Backend::Json);
        assert_eq!("memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert!("csv".parse::<Backend>().is_err());
        assert_eq!(Backend::default(), Backend::Json);
    }

    #[test]
    fn test_boxed_sink_forwards() {
        let mut sink: Box<dyn OutputSink> = Backend::Memory.create_sink();
        let root = sink.open(Path::new("run.nxs")).unwrap();
        let entry = sink.create_group(root, "entry").unwrap();
        sink.create_dataset(entry, "title", &TypedValue::text("scan"))
            .unwrap();
        sink.close().unwrap();
    }
}
