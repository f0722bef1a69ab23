//! Device schemas: the declarative description of the output tree.
//!
//! Each device has one schema, written in YAML, that describes the device's
//! group in the output file. Schemas are parsed into a typed tree
//! ([`model`]), checked against a [`ContractRegistry`] ([`validate`]) and then
//! kept read-only for the lifetime of the writer in a [`SchemaSet`].

pub mod contract;
pub mod model;
pub mod parse;
pub mod validate;

pub use contract::{Contract, ContractRegistry, GENERAL_MODEL};
pub use model::{
    AttributeNode, Attrs, DatasetNode, GroupNode, SchemaModel, SchemaNode, SchemaValue,
    Transformation,
};
pub use parse::{parse, parse_value};
pub use validate::validate;

use crate::error::{AppResult, SchemaError, SchemaErrorKind};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA_EXTENSIONS: [&str; 2] = ["yml", "yaml"];

/// Parse and validate in one step.
pub fn load(device: &str, text: &str, registry: &ContractRegistry) -> Result<SchemaModel, SchemaError> {
    validate(parse(device, text)?, registry)
}

/// Schema used for a device that has none: an open group named after it.
pub fn fallback(device: &str) -> SchemaModel {
    let mut root = GroupNode::new(device, format!("NX{}", device));
    root.nx_model = Some(GENERAL_MODEL.to_string());
    SchemaModel {
        device: device.to_string(),
        root,
    }
}

/// Validated schemas by device name.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    registry: ContractRegistry,
    schemas: BTreeMap<String, Arc<SchemaModel>>,
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self::new(ContractRegistry::builtin())
    }
}

impl SchemaSet {
    pub fn new(registry: ContractRegistry) -> Self {
        Self {
            registry,
            schemas: BTreeMap::new(),
        }
    }

    /// Load every `*.yml`/`*.yaml` file of `dir`; the file stem names the device.
    pub fn load_dir(dir: impl AsRef<Path>, registry: ContractRegistry) -> AppResult<Self> {
        let dir = dir.as_ref();
        let mut set = Self::new(registry);

        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| SCHEMA_EXTENSIONS.contains(&ext))
            })
            .collect();
        files.sort();

        for file in files {
            let Some(device) = file.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&file)?;
            set.insert_yaml(device, &text)?;
            debug!("Loaded schema for '{}' from {}", device, file.display());
        }

        info!("Loaded {} device schema(s) from {}", set.len(), dir.display());
        Ok(set)
    }

    /// Validate and add a schema, replacing any previous schema of the same device.
    pub fn insert(&mut self, model: SchemaModel) -> Result<(), SchemaError> {
        let model = validate(model, &self.registry)?;
        self.schemas.insert(model.device.clone(), Arc::new(model));
        Ok(())
    }

    pub fn insert_yaml(&mut self, device: &str, text: &str) -> Result<(), SchemaError> {
        self.insert(parse(device, text)?)
    }

    /// A copy of this set with the schemas embedded in a start document layered on top.
    pub fn with_embedded(&self, embedded: &Map<String, Value>) -> Result<Self, SchemaError> {
        let mut set = self.clone();
        for (device, schema) in embedded {
            let document = serde_yaml::to_value(schema).map_err(|e| {
                SchemaError::new(SchemaErrorKind::Syntax, device.as_str(), e.to_string())
            })?;
            set.insert(parse_value(device, document)?)?;
            debug!("Using schema embedded in the start document for '{}'", device);
        }
        Ok(set)
    }

    pub fn get(&self, device: &str) -> Option<Arc<SchemaModel>> {
        self.schemas.get(device).cloned()
    }

    /// The device's schema, or the fallback schema when it has none.
    pub fn for_device(&self, device: &str) -> Arc<SchemaModel> {
        self.get(device).unwrap_or_else(|| Arc::new(fallback(device)))
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SchemaModel>> {
        self.schemas.values()
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
