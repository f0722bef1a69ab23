//! Device capability interface used for pre-run resolution.
//!
//! The writer needs two things from a device: a snapshot of its static
//! metadata (for `$pre-run-md:` paths) and the ability to read one of its
//! sub-components when the run starts (for `$pre-run-cpt:` paths). Devices
//! are shared read-only, so implementations must be `Send + Sync`.

use crate::error::{AppResult, DeviceError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub trait Device: Send + Sync {
    /// Name under which the device appears in run documents.
    fn name(&self) -> &str;

    /// Static metadata snapshot (a mapping).
    fn metadata(&self) -> &Value;

    /// Read a sub-component. An empty path reads the device's own value.
    fn read_component(&self, path: &[String]) -> Result<Value, DeviceError>;
}

/// A device backed by fixed values, loadable from YAML.
///
/// ```yaml
/// mono:
///   metadata:
///     description: Plane grating monochromator
///     transformations_axisname: alpha
///   components:
///     grating: 1200
///     en: 7.5
///   readback: 7.5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticDevice {
    #[serde(skip)]
    name: String,
    #[serde(default = "empty_mapping")]
    metadata: Value,
    #[serde(default = "empty_mapping")]
    components: Value,
    #[serde(default)]
    readback: Option<Value>,
    /// Component paths (joined with `.`) whose reads fail with the given reason.
    #[serde(default)]
    failures: HashMap<String, String>,
}

fn empty_mapping() -> Value {
    Value::Object(Map::new())
}

impl StaticDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: empty_mapping(),
            components: empty_mapping(),
            readback: None,
            failures: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set a component value at a dotted path (`grating.order`).
    pub fn with_component(mut self, path: &str, value: Value) -> Self {
        let mut node = &mut self.components;
        for segment in path.split('.') {
            if !node.is_object() {
                *node = empty_mapping();
            }
            let Value::Object(map) = node else { break };
            node = map.entry(segment.to_string()).or_insert(Value::Null);
        }
        *node = value;
        self
    }

    pub fn with_readback(mut self, value: Value) -> Self {
        self.readback = Some(value);
        self
    }

    /// Make reads of `path` fail.
    pub fn with_failure(mut self, path: &str, reason: &str) -> Self {
        self.failures.insert(path.to_string(), reason.to_string());
        self
    }
}

impl Device for StaticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> &Value {
        &self.metadata
    }

    fn read_component(&self, path: &[String]) -> Result<Value, DeviceError> {
        if let Some(reason) = self.failures.get(&path.join(".")) {
            return Err(DeviceError::ReadFailed(reason.clone()));
        }
        if path.is_empty() {
            return self
                .readback
                .clone()
                .ok_or_else(|| DeviceError::UnknownComponent(self.name.clone()));
        }
        lookup(&self.components, path)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownComponent(path.join(".")))
    }
}

/// Nested mapping lookup; every segment must exist.
pub fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |node, segment| node.as_object()?.get(segment))
}

/// Devices known to the writer, by name.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<dyn Device>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, device: Arc<dyn Device>) {
        self.devices.insert(device.name().to_string(), device);
    }

    pub fn with(mut self, device: impl Device + 'static) -> Self {
        self.register(Arc::new(device));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Device>> {
        self.devices.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Parse a YAML mapping of device name to [`StaticDevice`] definition.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let definitions: BTreeMap<String, StaticDevice> = serde_yaml::from_str(text)?;
        let mut registry = Self::new();
        for (name, mut device) in definitions {
            device.name = name;
            registry.register(Arc::new(device));
        }
        Ok(registry)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let registry = Self::from_yaml(&text).map_err(|e| {
            crate::error::NexusError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })?;
        info!("Loaded {} device(s) from {}", registry.len(), path.display());
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_static_device_reads() {
        let device = StaticDevice::new("mono")
            .with_component("grating", json!(1200))
            .with_component("crystal.d_spacing", json!(3.1))
            .with_readback(json!(7.5))
            .with_failure("broken", "timeout");

        assert_eq!(device.read_component(&path(&["grating"])).unwrap(), json!(1200));
        assert_eq!(
            device.read_component(&path(&["crystal", "d_spacing"])).unwrap(),
            json!(3.1)
        );
        assert_eq!(device.read_component(&[]).unwrap(), json!(7.5));
        assert_eq!(
            device.read_component(&path(&["missing"])).unwrap_err(),
            DeviceError::UnknownComponent("missing".into())
        );
        assert_eq!(
            device.read_component(&path(&["broken"])).unwrap_err(),
            DeviceError::ReadFailed("timeout".into())
        );
    }

    #[test]
    fn test_lookup() {
        let value = json!({"worldPosition": {"x": 1.5}});
        assert_eq!(lookup(&value, &path(&["worldPosition", "x"])), Some(&json!(1.5)));
        assert_eq!(lookup(&value, &path(&["worldPosition", "y"])), None);
        assert_eq!(lookup(&value, &[]), Some(&value));
    }

    #[test]
    fn test_registry_from_yaml() {
        let registry = DeviceRegistry::from_yaml(
            "mono:\n  metadata:\n    description: PGM\n  components:\n    grating: 1200\nmotor: {}\n",
        )
        .unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["mono", "motor"]);

        let mono = registry.get("mono").unwrap();
        assert_eq!(mono.name(), "mono");
        assert_eq!(mono.metadata()["description"], json!("PGM"));
    }
}
