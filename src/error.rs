//! Custom error types for the application.
//!
//! This module defines the primary error type, `NexusError`, together with the
//! per-concern error enums it aggregates. Using the `thiserror` crate, it provides
//! a centralized and consistent way to handle everything that can go wrong between
//! loading a schema and closing the output file of a run.
//!
//! ## Error Hierarchy
//!
//! - **`Schema`**: structural problems detected while loading a schema. These are
//!   fatal for that schema and are reported before any run starts.
//! - **`Sink`**: the output backend failed. The run's file can no longer be trusted,
//!   so the remaining materialization is aborted.
//! - **`Io`**: reading schema directories or device definitions.
//! - **`InvalidState`**: a document arrived that the writer cannot accept yet.
//!
//! Resolution, evaluation and coercion failures are tied to a single leaf of the
//! output tree. They are never raised; they are collected as [`LeafError`]s in the
//! run report so the rest of the tree can still be written.
//!
//! By using `#[from]`, `NexusError` can be created from the underlying error types,
//! so the `?` operator works across module boundaries.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, NexusError>;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Document '{document}' not accepted while the writer is {state}")]
    InvalidState {
        document: &'static str,
        state: &'static str,
    },
}

/// Category of a [`SchemaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    MissingNxclass,
    MissingDtype,
    ContractViolation,
    UnknownModel,
    UnexpectedKey,
    InvalidDtype,
    InvalidTransformation,
    Syntax,
}

/// Structural error found while parsing or validating a schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Schema error ({kind:?}) at '{path}': {message}")]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(kind: SchemaErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Metadata key '{path}' not found for device '{device}'")]
    MissingMetadataKey { device: String, path: String },

    #[error("Reading component '{component}' of device '{device}' failed: {reason}")]
    ComponentReadError {
        device: String,
        component: String,
        reason: String,
    },

    #[error("No stream of the run contains data for '{key}'")]
    UnresolvedPlaceholder { key: String },

    #[error("Device '{0}' is not registered")]
    UnknownDevice(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unknown identifier '{0}' in transformation")]
    UnknownIdentifier(String),

    #[error("Transformation expects numeric input: {0}")]
    TypeMismatch(String),

    #[error("Division by zero in transformation")]
    DivisionByZero,

    #[error("Transformation result is not a finite number")]
    Domain,

    #[error("Syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot coerce {value} to {dtype}: {reason}")]
pub struct CoercionError {
    pub value: String,
    pub dtype: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Output node '{0}' already exists")]
    Duplicate(String),

    #[error("Unknown output handle {0}")]
    UnknownHandle(usize),

    #[error("Output sink is already closed")]
    Closed,

    #[error("Output I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Output backend error: {0}")]
    Backend(String),

    #[error("Output backend requires feature '{0}'")]
    FeatureNotEnabled(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Component '{0}' does not exist")]
    UnknownComponent(String),

    #[error("Component read failed: {0}")]
    ReadFailed(String),
}

/// A failure localized to one leaf of the output tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LeafError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LeafError::from(ResolveError::UnresolvedPlaceholder {
            key: "mono_en".into(),
        });
        assert_eq!(
            err.to_string(),
            "No stream of the run contains data for 'mono_en'"
        );

        let err = NexusError::from(SinkError::FeatureNotEnabled("storage_hdf5".into()));
        assert_eq!(
            err.to_string(),
            "Output backend requires feature 'storage_hdf5'"
        );
    }

    #[test]
    fn test_schema_error_carries_path() {
        let err = SchemaError::new(SchemaErrorKind::MissingDtype, "mono/energy", "literal value");
        assert!(err.to_string().contains("mono/energy"));
        assert_eq!(err.kind, SchemaErrorKind::MissingDtype);
    }
}
