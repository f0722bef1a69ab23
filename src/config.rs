//! Configuration System using Figment
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `DAQ_NEXUS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_NEXUS_APPLICATION__LOG_LEVEL=debug
//! DAQ_NEXUS_OUTPUT__DIRECTORY=/data/nexus
//! DAQ_NEXUS_RESOLUTION__STREAM_PRECEDENCE=last_registered
//! DAQ_NEXUS_MATERIALIZE__FAILURE_POLICY=sentinel
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [output]
//! directory = "/data/nexus"
//! file_name = "scan_{uid}"
//! backend = "hdf5"
//!
//! [resolution]
//! component_delimiter = "_"
//! baseline_stream = "baseline"
//! stream_precedence = "first_registered"
//! event_accumulation = "series"
//!
//! [materialize]
//! failure_policy = "sentinel"
//! sentinel_value = "unavailable"
//!
//! [schema]
//! directory = "schemas"
//! ```

use crate::materializer::{FailurePolicy, WriterOptions};
use crate::resolve::ResolutionSettings;
use crate::sink::Backend;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_PREFIX: &str = "DAQ_NEXUS_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub output: OutputConfig,
    pub resolution: ResolutionSettings,
    pub materialize: MaterializeConfig,
    pub schema: SchemaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory output files are written to
    pub directory: PathBuf,
    /// File name template; `{uid}` is replaced by the run uid
    pub file_name: Option<String>,
    pub backend: Backend,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: None,
            backend: Backend::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicyKind {
    #[default]
    Omit,
    Sentinel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializeConfig {
    pub failure_policy: FailurePolicyKind,
    /// Text written in place of a failed dataset (sentinel policy only)
    pub sentinel_value: Option<String>,
}

impl MaterializeConfig {
    pub fn policy(&self) -> FailurePolicy {
        match self.failure_policy {
            FailurePolicyKind::Omit => FailurePolicy::Omit,
            FailurePolicyKind::Sentinel => {
                FailurePolicy::Sentinel(self.sentinel_value.clone().unwrap_or_default())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Directory holding one `<device>.yml` schema per device
    pub directory: Option<PathBuf>,
}

impl Settings {
    /// Load defaults overlaid by environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Load from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(ConfigError::LoadError)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Component delimiter and baseline stream name are not empty
    /// - The sentinel policy has a sentinel value
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.resolution.component_delimiter.is_empty() {
            return Err(ConfigError::ValidationError(
                "resolution.component_delimiter cannot be empty".to_string(),
            ));
        }

        if self.resolution.baseline_stream.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "resolution.baseline_stream cannot be empty".to_string(),
            ));
        }

        if self.materialize.failure_policy == FailurePolicyKind::Sentinel
            && self.materialize.sentinel_value.is_none()
        {
            return Err(ConfigError::ValidationError(
                "materialize.sentinel_value is required when failure_policy is 'sentinel'"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Options for a [`crate::materializer::RunMaterializer`].
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            output_dir: self.output.directory.clone(),
            file_name: self.output.file_name.clone(),
            failure_policy: self.materialize.policy(),
            resolution: self.resolution.clone(),
        }
    }
}
