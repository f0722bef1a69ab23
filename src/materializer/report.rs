//! Outcome of one materialized run.

use crate::error::LeafError;
use std::fmt;
use std::path::PathBuf;

/// A leaf that could not be written, with its schema path (`mono/energy`,
/// `mono/energy@units`).
#[derive(Debug, Clone, PartialEq)]
pub struct LeafFailure {
    pub path: String,
    pub error: LeafError,
}

impl fmt::Display for LeafFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub uid: String,
    pub output_path: PathBuf,
    /// Datasets and schema attributes written from resolved values.
    pub leaves_written: usize,
    pub failures: Vec<LeafFailure>,
}

impl RunReport {
    /// True when every leaf of every schema was written.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure(&self, path: &str) -> Option<&LeafFailure> {
        self.failures.iter().find(|failure| failure.path == path)
    }
}
