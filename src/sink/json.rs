//! JSON file sink.

use super::{MemorySink, NodeId, OutputSink};
use crate::coerce::TypedValue;
use crate::error::SinkError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Collects the tree in memory and writes it to `path` as pretty JSON on close.
#[derive(Debug, Default)]
pub struct JsonSink {
    tree: MemorySink,
    path: PathBuf,
}

impl JsonSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tree written so far.
    pub fn tree(&self) -> &MemorySink {
        &self.tree
    }
}

impl OutputSink for JsonSink {
    fn open(&mut self, path: &Path) -> Result<NodeId, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.path = path.to_path_buf();
        self.tree.open(path)
    }

    fn create_group(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SinkError> {
        self.tree.create_group(parent, name)
    }

    fn create_dataset(
        &mut self,
        parent: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<NodeId, SinkError> {
        self.tree.create_dataset(parent, name, value)
    }

    fn set_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<(), SinkError> {
        self.tree.set_attribute(node, name, value)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.tree.close()?;
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.tree.to_json())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!("JSON output written to '{}'", self.path.display());
        Ok(())
    }
}
