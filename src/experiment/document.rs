//! Document model for run data
//!
//! Bluesky-style documents as delivered by the acquisition orchestrator.
//! The writer only consumes them, so every type is lenient about extra keys:
//! whatever the orchestrator adds to a start document is kept in
//! [`StartDoc::metadata`] and copied into the output file verbatim.
//!
//! - **StartDoc**: Run intent and metadata
//! - **DescriptorDoc**: Data keys and configuration snapshot for one stream
//! - **EventDoc**: Values read at one point of a stream
//! - **StopDoc**: Completion status
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per data stream, e.g. "primary", "baseline")
//!    │       │
//!    │       └── EventDoc (N, measurements)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current time in seconds since the Unix epoch
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Documents of one run, tagged by document name.
///
/// Serialized as `{"name": "event", "doc": {...}}`, one per line in replay files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Document name as used by the orchestrator
    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start-document key under which per-device schemas may be embedded.
pub const SCHEMA_KEY: &str = "nexus_md";

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier
    pub uid: String,
    /// Seconds since the Unix epoch
    pub time: f64,
    /// Everything else the orchestrator put into the document
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl StartDoc {
    pub fn new() -> Self {
        Self {
            uid: new_uid(),
            time: now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Requested output file name (`nx_file_name` key), if any.
    pub fn file_name(&self) -> Option<&str> {
        self.metadata
            .get("nx_file_name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    /// Device schemas embedded under [`SCHEMA_KEY`], by device name.
    pub fn embedded_schemas(&self) -> Option<&Map<String, Value>> {
        self.metadata.get(SCHEMA_KEY).and_then(Value::as_object)
    }

    /// The document as a JSON mapping, including `uid` and `time`.
    pub fn to_mapping(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("uid".into(), Value::from(self.uid.clone()));
        map.insert("time".into(), Value::from(self.time));
        for (key, value) in &self.metadata {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    /// [`StartDoc::to_mapping`] without the embedded schemas.
    pub fn to_run_info(&self) -> Map<String, Value> {
        let mut map = self.to_mapping();
        map.shift_remove(SCHEMA_KEY);
        map
    }
}

impl Default for StartDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Description of one data key, as declared by the device that produces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Source type: "number", "integer", "string", "boolean", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars); unknown dimensions are `None`
    #[serde(default)]
    pub shape: Vec<Option<usize>>,
    /// Where the value came from, e.g. a PV name
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Display precision; EPICS records may report it as a float
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_ctrl_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_ctrl_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_strs: Option<Vec<String>>,
    /// Name of the device owning the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn number(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    /// Create a scalar integer data key
    pub fn integer(source: &str) -> Self {
        Self {
            dtype: "integer".to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    /// Create a string data key
    pub fn string(source: &str) -> Self {
        Self {
            dtype: "string".to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<usize>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape: shape.into_iter().map(Some).collect(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_precision(mut self, precision: i64) -> Self {
        self.precision = Some(Number::from(precision));
        self
    }

    pub fn with_limits(mut self, lower: f64, upper: f64) -> Self {
        self.lower_ctrl_limit = Some(lower);
        self.upper_ctrl_limit = Some(upper);
        self
    }

    pub fn with_object_name(mut self, name: &str) -> Self {
        self.object_name = Some(name.to_string());
        self
    }
}

/// Configuration readings of one device, captured when a descriptor is emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfiguration {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub timestamps: BTreeMap<String, f64>,
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
}

/// Descriptor document - declares the data keys of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    /// Stream name (e.g., "primary", "baseline")
    pub name: String,
    /// Keys carried by the events of this stream
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    /// Per-device configuration snapshot
    #[serde(default)]
    pub configuration: BTreeMap<String, DeviceConfiguration>,
    #[serde(default)]
    pub time: f64,
}

impl DescriptorDoc {
    pub fn new(run_start: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            configuration: BTreeMap::new(),
            time: now(),
        }
    }

    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }

    /// Add a configuration reading for `device`.
    pub fn with_config(
        mut self,
        device: &str,
        name: &str,
        key: DataKey,
        value: impl Into<Value>,
    ) -> Self {
        let entry = self.configuration.entry(device.to_string()).or_default();
        entry.data.insert(name.to_string(), value.into());
        entry.timestamps.insert(name.to_string(), self.time);
        entry.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Event document - values read at one point of a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to the DescriptorDoc of the stream
    pub descriptor: String,
    /// Event sequence number within the stream
    #[serde(default)]
    pub seq_num: u64,
    #[serde(default)]
    pub time: f64,
    /// Values (data key -> value)
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Per-key timestamps
    #[serde(default)]
    pub timestamps: BTreeMap<String, f64>,
}

impl EventDoc {
    pub fn new(descriptor: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            descriptor: descriptor.to_string(),
            seq_num,
            time: now(),
            data: Map::new(),
            timestamps: BTreeMap::new(),
        }
    }

    pub fn with_datum(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self.timestamps.insert(key.to_string(), self.time);
        self
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    pub uid: String,
    /// Links to StartDoc
    pub run_start: String,
    #[serde(default)]
    pub time: f64,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    #[serde(default)]
    pub reason: String,
    /// Events emitted per stream
    #[serde(default)]
    pub num_events: BTreeMap<String, u64>,
}

impl StopDoc {
    pub fn success(run_start: &str) -> Self {
        Self {
            uid: new_uid(),
            run_start: run_start.to_string(),
            time: now(),
            exit_status: "success".to_string(),
            reason: String::new(),
            num_events: BTreeMap::new(),
        }
    }

    pub fn fail(run_start: &str, reason: &str) -> Self {
        Self {
            exit_status: "fail".to_string(),
            reason: reason.to_string(),
            ..Self::success(run_start)
        }
    }

    /// The document as a JSON mapping.
    pub fn to_mapping(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
