//! Depth-first walk that turns a closed run into sink calls.
//!
//! Output layout:
//!
//! ```text
//! / (default = "entry")
//! └── entry                 NXentry
//!     ├── instrument        NXinstrument
//!     │   └── <device>      one group per device schema
//!     └── run_info          NXcollection
//!         ├── start         start document without embedded schemas
//!         └── stop          stop document
//! ```
//!
//! Leaf failures are recorded and the walk continues with the next sibling.
//! Sink errors end the walk.

use super::report::LeafFailure;
use super::FailurePolicy;
use crate::coerce::{canonical_json, coerce_attr, coerce_with_dtype, TypedData, TypedValue};
use crate::dtype::Dtype;
use crate::error::{CoercionError, LeafError, ResolveError, SinkError};
use crate::experiment::DataKey;
use crate::resolve::{Resolver, RunContext};
use crate::schema::{AttributeNode, DatasetNode, GroupNode, SchemaModel, SchemaNode, SchemaValue};
use crate::sink::{NodeId, OutputSink};
use crate::value::{ResolvedValue, Timestamps};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

pub(crate) const APPLICATION_NAME: &str = env!("CARGO_PKG_NAME");
pub(crate) const APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

const EVENTS_TIMESTAMPS: &str = "events_timestamps";

/// Attributes of one node, later assignments to a name replacing earlier ones.
#[derive(Debug, Default)]
struct AttributeSet(Vec<(String, TypedValue)>);

impl AttributeSet {
    fn set(&mut self, name: &str, value: TypedValue) {
        match self.0.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    fn set_default(&mut self, name: &str, value: TypedValue) {
        if !self.contains(name) {
            self.0.push((name.to_string(), value));
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(key, _)| key == name)
    }
}

pub(crate) struct TreeWriter<'a, S: OutputSink + ?Sized> {
    sink: &'a mut S,
    ctx: &'a RunContext,
    resolver: &'a Resolver,
    policy: &'a FailurePolicy,
    pub(crate) leaves_written: usize,
    pub(crate) failures: Vec<LeafFailure>,
}

impl<'a, S: OutputSink + ?Sized> TreeWriter<'a, S> {
    pub(crate) fn new(
        sink: &'a mut S,
        ctx: &'a RunContext,
        resolver: &'a Resolver,
        policy: &'a FailurePolicy,
    ) -> Self {
        Self {
            sink,
            ctx,
            resolver,
            policy,
            leaves_written: 0,
            failures: Vec::new(),
        }
    }

    /// Write the whole file below an already opened root.
    pub(crate) fn write_run(
        &mut self,
        root: NodeId,
        schemas: &[std::sync::Arc<SchemaModel>],
    ) -> Result<(), SinkError> {
        self.sink
            .set_attribute(root, "default", &TypedValue::text("entry"))?;

        let entry = self.sink.create_group(root, "entry")?;
        self.sink
            .set_attribute(entry, "NX_class", &TypedValue::text("NXentry"))?;
        self.sink.set_attribute(
            entry,
            "application_name",
            &TypedValue::text(APPLICATION_NAME),
        )?;
        self.sink.set_attribute(
            entry,
            "application_version",
            &TypedValue::text(APPLICATION_VERSION),
        )?;

        let instrument = self.sink.create_group(entry, "instrument")?;
        self.sink
            .set_attribute(instrument, "NX_class", &TypedValue::text("NXinstrument"))?;
        for schema in schemas {
            debug!("Materializing schema of '{}'", schema.device);
            self.write_group(instrument, &schema.device, &schema.device, &schema.root)?;
        }

        let run_info = self.sink.create_group(entry, "run_info")?;
        self.sink
            .set_attribute(run_info, "NX_class", &TypedValue::text("NXcollection"))?;
        self.sink.set_attribute(
            run_info,
            "description",
            &TypedValue::text("Copy of the start and stop document of the run"),
        )?;
        let start = self.ctx.start.to_run_info();
        self.write_collection(run_info, "start", &start)?;
        let stop = self
            .ctx
            .stop
            .as_ref()
            .map(|stop| stop.to_mapping())
            .unwrap_or_default();
        self.write_collection(run_info, "stop", &stop)?;
        Ok(())
    }

    fn write_group(
        &mut self,
        parent: NodeId,
        device: &str,
        path: &str,
        group: &GroupNode,
    ) -> Result<(), SinkError> {
        let id = self.sink.create_group(parent, &group.name)?;

        let mut attrs = AttributeSet::default();
        attrs.set("NX_class", TypedValue::text(group.nxclass.as_str()));
        if let Some(default) = &group.default {
            attrs.set("default", TypedValue::text(default.as_str()));
        }
        let inline = group.children.iter().filter_map(|child| match child {
            SchemaNode::Attribute(attribute) => Some(attribute),
            _ => None,
        });
        for attribute in group.attributes.iter().chain(inline) {
            if let Some(value) = self.attribute_leaf(device, path, attribute) {
                attrs.set(&attribute.name, value);
            }
        }
        self.user_attrs(path, &group.attrs, &mut attrs);
        self.flush_attributes(id, attrs)?;

        let reserved: HashSet<&str> = group.children.iter().map(SchemaNode::name).collect();
        let mut auxiliary = HashSet::new();
        for child in &group.children {
            let child_path = format!("{}/{}", path, child.name());
            match child {
                SchemaNode::Group(inner) => self.write_group(id, device, &child_path, inner)?,
                SchemaNode::Dataset(dataset) => {
                    self.write_dataset(id, device, &child_path, dataset, &reserved, &mut auxiliary)?
                }
                SchemaNode::Attribute(_) => {}
            }
        }
        Ok(())
    }

    fn write_dataset(
        &mut self,
        parent: NodeId,
        device: &str,
        path: &str,
        dataset: &DatasetNode,
        reserved: &HashSet<&str>,
        auxiliary: &mut HashSet<String>,
    ) -> Result<(), SinkError> {
        let (resolved, typed) = match self.dataset_value(device, dataset) {
            Ok(value) => value,
            Err(error) => {
                self.record(path, error.clone());
                if let FailurePolicy::Sentinel(text) = self.policy {
                    let id = self
                        .sink
                        .create_dataset(parent, &dataset.name, &TypedValue::text(text.as_str()))?;
                    let mut attrs = AttributeSet::default();
                    attrs.set("NX_class", TypedValue::text(dataset.nxclass.as_str()));
                    attrs.set("resolution_error", TypedValue::text(error.to_string()));
                    self.flush_attributes(id, attrs)?;
                }
                return Ok(());
            }
        };

        let id = self.sink.create_dataset(parent, &dataset.name, &typed)?;
        self.leaves_written += 1;

        let mut attrs = AttributeSet::default();
        for attribute in &dataset.attributes {
            if let Some(value) = self.attribute_leaf(device, path, attribute) {
                attrs.set(&attribute.name, value);
            }
        }
        if !dataset.value.is_literal() || dataset.shape.is_some() {
            attrs.set("shape", shape_attribute(&typed.shape));
        }
        attrs.set("NX_class", TypedValue::text(dataset.nxclass.as_str()));
        if let Some(transformation) = &dataset.transformation {
            let text = canonical_json(&json!({
                "expression": transformation.expression.source(),
                "target": transformation.target,
            }));
            attrs.set("transformation", TypedValue::text(text));
        }
        self.user_attrs(path, &dataset.attrs, &mut attrs);
        if let Some(description) = &resolved.description {
            for (name, value) in described_attributes(description) {
                attrs.set_default(name, value);
            }
        }
        self.flush_attributes(id, attrs)?;

        if let Some(timestamps) = &resolved.timestamps {
            self.write_timestamps(parent, &dataset.name, timestamps, reserved, auxiliary)?;
        }
        Ok(())
    }

    fn dataset_value(
        &self,
        device: &str,
        dataset: &DatasetNode,
    ) -> Result<(ResolvedValue, TypedValue), LeafError> {
        let mut resolved = self.resolve(device, &dataset.value)?;
        if let Some(transformation) = &dataset.transformation {
            resolved = transformation.expression.apply(resolved)?;
        }
        let dtype = dataset
            .dtype
            .or_else(|| array_dtype_attr(dataset, &resolved))
            .or(resolved.dtype)
            .unwrap_or(Dtype::Str);
        let mut typed = coerce_with_dtype(&resolved.raw, dtype)?;
        if let Some(shape) = &dataset.shape {
            reshape(&mut typed, shape, &resolved.raw)?;
        }
        Ok((resolved, typed))
    }

    fn resolve(&self, device: &str, value: &SchemaValue) -> Result<ResolvedValue, ResolveError> {
        match value {
            SchemaValue::Literal(raw) => Ok(ResolvedValue::new(raw.clone())),
            SchemaValue::Placeholder(placeholder) if placeholder.is_pre_run() => self
                .ctx
                .pre_run(device, placeholder)
                .cloned()
                .unwrap_or_else(|| {
                    Err(ResolveError::UnresolvedPlaceholder {
                        key: placeholder.to_string(),
                    })
                }),
            SchemaValue::Placeholder(placeholder) => {
                self.resolver.resolve_post_run(placeholder, device, self.ctx)
            }
        }
    }

    /// Resolve and coerce a schema attribute; failures are recorded and yield `None`.
    fn attribute_leaf(
        &mut self,
        device: &str,
        owner: &str,
        attribute: &AttributeNode,
    ) -> Option<TypedValue> {
        let result = self
            .resolve(device, &attribute.value)
            .map_err(LeafError::from)
            .and_then(|resolved| {
                let dtype = attribute.dtype.or(resolved.dtype).unwrap_or(Dtype::Str);
                coerce_with_dtype(&resolved.raw, dtype).map_err(LeafError::from)
            });
        match result {
            Ok(value) => {
                self.leaves_written += 1;
                Some(value)
            }
            Err(error) => {
                self.record(&format!("{}@{}", owner, attribute.name), error);
                None
            }
        }
    }

    fn user_attrs(&mut self, owner: &str, raw: &[(String, Value)], attrs: &mut AttributeSet) {
        for (name, value) in raw {
            match coerce_attr(value) {
                Ok(typed) => attrs.set(name, typed),
                Err(error) => self.record(&format!("{}@{}", owner, name), error.into()),
            }
        }
    }

    fn write_timestamps(
        &mut self,
        parent: NodeId,
        name: &str,
        timestamps: &Timestamps,
        reserved: &HashSet<&str>,
        auxiliary: &mut HashSet<String>,
    ) -> Result<(), SinkError> {
        match timestamps {
            Timestamps::Events { component, events } => {
                self.auxiliary_dataset(
                    parent,
                    &format!("{}_timestamps", name),
                    TypedValue::float_array(component.clone()),
                    &format!("Timestamps of the component: {} extracted from the events", name),
                    reserved,
                    auxiliary,
                )?;
                if !auxiliary.contains(EVENTS_TIMESTAMPS) {
                    self.auxiliary_dataset(
                        parent,
                        EVENTS_TIMESTAMPS,
                        TypedValue::float_array(events.clone()),
                        "Timestamps of the events",
                        reserved,
                        auxiliary,
                    )?;
                }
            }
            Timestamps::Descriptor(timestamp) => {
                self.auxiliary_dataset(
                    parent,
                    &format!("{}_timestamp", name),
                    TypedValue::float(*timestamp),
                    &format!(
                        "Timestamp of the component: {} extracted from the descriptor",
                        name
                    ),
                    reserved,
                    auxiliary,
                )?;
            }
        }
        Ok(())
    }

    fn auxiliary_dataset(
        &mut self,
        parent: NodeId,
        name: &str,
        value: TypedValue,
        description: &str,
        reserved: &HashSet<&str>,
        auxiliary: &mut HashSet<String>,
    ) -> Result<(), SinkError> {
        if reserved.contains(name) || auxiliary.contains(name) {
            warn!("Skipping '{}': the name is already used in this group", name);
            return Ok(());
        }
        let id = self.sink.create_dataset(parent, name, &value)?;
        let mut attrs = AttributeSet::default();
        attrs.set("NX_class", TypedValue::text("NX_FLOAT"));
        attrs.set("shape", shape_attribute(&value.shape));
        attrs.set("description", TypedValue::text(description));
        self.flush_attributes(id, attrs)?;
        auxiliary.insert(name.to_string());
        Ok(())
    }

    /// Collection rules: mappings become groups, scalars and flat lists become
    /// datasets, nested lists become text.
    fn write_collection(
        &mut self,
        parent: NodeId,
        name: &str,
        mapping: &Map<String, Value>,
    ) -> Result<(), SinkError> {
        let id = self.sink.create_group(parent, name)?;
        for (key, value) in mapping {
            match value {
                Value::Object(inner) => self.write_collection(id, key, inner)?,
                Value::Null => debug!("Skipping null run_info entry '{}/{}'", name, key),
                other => {
                    self.sink.create_dataset(id, key, &collection_value(other))?;
                }
            }
        }
        Ok(())
    }

    fn flush_attributes(&mut self, node: NodeId, attrs: AttributeSet) -> Result<(), SinkError> {
        for (name, value) in &attrs.0 {
            self.sink.set_attribute(node, name, value)?;
        }
        Ok(())
    }

    fn record(&mut self, path: &str, error: LeafError) {
        warn!("Leaf '{}' not written: {}", path, error);
        self.failures.push(LeafFailure {
            path: path.to_string(),
            error,
        });
    }
}

fn collection_value(value: &Value) -> TypedValue {
    match value {
        Value::Array(items) if items.iter().any(Value::is_array) => {
            TypedValue::text(canonical_json(value))
        }
        Value::Array(items) if items.iter().any(Value::is_string) => TypedValue::text_array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        other => coerce_attr(other).unwrap_or_else(|_| TypedValue::text(canonical_json(other))),
    }
}

fn shape_attribute(shape: &[usize]) -> TypedValue {
    TypedValue {
        dtype: Dtype::Int64,
        shape: vec![shape.len()],
        data: TypedData::Int(shape.iter().map(|dim| *dim as i64).collect()),
    }
}

fn reshape(typed: &mut TypedValue, shape: &[usize], raw: &Value) -> Result<(), CoercionError> {
    let expected: usize = shape.iter().product();
    if expected != typed.data.len() {
        return Err(CoercionError {
            value: raw.to_string(),
            dtype: typed.dtype.to_string(),
            reason: format!(
                "{} element(s) do not fit the declared shape {:?}",
                typed.data.len(),
                shape
            ),
        });
    }
    typed.shape = shape.to_vec();
    Ok(())
}

/// A `dtype` entry in `attrs` overrides the default of array sources.
fn array_dtype_attr(dataset: &DatasetNode, resolved: &ResolvedValue) -> Option<Dtype> {
    let key = resolved.description.as_ref()?;
    if key.dtype != "array" {
        return None;
    }
    dataset
        .attrs
        .iter()
        .find(|(name, _)| name == "dtype")
        .and_then(|(_, value)| value.as_str())
        .and_then(|text| text.parse().ok())
}

/// Attributes derived from the descriptor data key of a post-run value.
fn described_attributes(key: &DataKey) -> Vec<(&'static str, TypedValue)> {
    let mut attrs = Vec::new();
    let source = if key.source.is_empty() {
        "unknown"
    } else {
        key.source.as_str()
    };
    attrs.push(("source", TypedValue::text(source)));
    if let Some(units) = &key.units {
        attrs.push(("units", TypedValue::text(units.as_str())));
    }
    if let Some(external) = &key.external {
        attrs.push(("external", TypedValue::text(external.as_str())));
    }
    if let Some(precision) = &key.precision {
        let value = match precision.as_i64() {
            Some(whole) => Some(TypedValue::int(whole)),
            None => precision.as_f64().map(TypedValue::float),
        };
        if let Some(value) = value {
            attrs.push(("precision", value));
        }
    }
    if let Some(lower) = key.lower_ctrl_limit {
        attrs.push(("lower_ctrl_limit", TypedValue::float(lower)));
    }
    if let Some(upper) = key.upper_ctrl_limit {
        attrs.push(("upper_ctrl_limit", TypedValue::float(upper)));
    }
    if let Some(enum_strs) = &key.enum_strs {
        attrs.push(("enum_strs", TypedValue::text_array(enum_strs.clone())));
    }
    if let Some(object_name) = &key.object_name {
        attrs.push(("object_name", TypedValue::text(object_name.as_str())));
    }
    attrs
}
