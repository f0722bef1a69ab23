//! YAML schema text to [`SchemaModel`].
//!
//! A device schema is a mapping describing the device's root group:
//!
//! ```yaml
//! nx_model: NXmonochromatorModel
//! nxclass: NXmonochromator
//! energy:
//!   nxclass: NX_FLOAT
//!   value: $post-run:en
//!   dtype: float64
//!   attrs:
//!     units: keV
//! GRATING:
//!   nxclass: NXgrating
//!   diffraction_order:
//!     nxclass: NX_INT
//!     value: $pre-run-cpt:grating
//!     dtype: int32
//! ```
//!
//! Inside a group, a mapping with a `value` key is a dataset and any other
//! mapping is a sub-group. Scalars and lists under other keys are folded into
//! the group's `attrs`. Mappings with `active: false` are dropped entirely.

use super::model::{
    AttributeNode, Attrs, DatasetNode, GroupNode, SchemaModel, SchemaNode, SchemaValue,
    Transformation,
};
use crate::dtype::Dtype;
use crate::error::{SchemaError, SchemaErrorKind};
use crate::transform::Expression;
use serde_yaml::{Mapping, Value as Yaml};

const ACTIVE: &str = "active";

const GROUP_KEYS: [&str; 5] = ["nxclass", "nx_model", "default", "attrs", "attributes"];
const DATASET_KEYS: [&str; 7] = [
    "nxclass",
    "value",
    "dtype",
    "shape",
    "attributes",
    "attrs",
    "transformation",
];
const ATTRIBUTE_KEYS: [&str; 4] = ["value", "dtype", "nxclass", "shape"];
const TRANSFORMATION_KEYS: [&str; 2] = ["expression", "target"];

/// Parse the schema of `device` from YAML text. The result is not yet validated.
pub fn parse(device: &str, text: &str) -> Result<SchemaModel, SchemaError> {
    let document: Yaml = serde_yaml::from_str(text)
        .map_err(|e| SchemaError::new(SchemaErrorKind::Syntax, device, e.to_string()))?;
    parse_value(device, document)
}

/// Parse an already-loaded YAML document.
pub fn parse_value(device: &str, document: Yaml) -> Result<SchemaModel, SchemaError> {
    let document = filter_inactive(document);
    let mapping = match document {
        Yaml::Mapping(mapping) => mapping,
        other => {
            return Err(SchemaError::new(
                SchemaErrorKind::Syntax,
                device,
                format!("schema must be a mapping, got {}", yaml_kind(&other)),
            ))
        }
    };

    let root = parse_group(device, device, &mapping)?;
    Ok(SchemaModel {
        device: device.to_string(),
        root,
    })
}

/// Removes mappings whose `active` flag is false and every `active` key.
fn filter_inactive(value: Yaml) -> Yaml {
    match value {
        Yaml::Mapping(mapping) => Yaml::Mapping(
            mapping
                .into_iter()
                .filter(|(key, _)| key.as_str() != Some(ACTIVE))
                .filter(|(_, value)| !is_inactive(value))
                .map(|(key, value)| (key, filter_inactive(value)))
                .collect(),
        ),
        other => other,
    }
}

fn is_inactive(value: &Yaml) -> bool {
    value
        .as_mapping()
        .and_then(|mapping| mapping.get(ACTIVE))
        .and_then(Yaml::as_bool)
        == Some(false)
}

fn parse_group(name: &str, path: &str, mapping: &Mapping) -> Result<GroupNode, SchemaError> {
    let mut group = GroupNode::new(name, required_string(mapping, "nxclass", path, SchemaErrorKind::MissingNxclass)?);
    group.nx_model = optional_string(mapping, "nx_model", path)?;
    group.default = optional_string(mapping, "default", path)?;

    for (key, value) in mapping {
        let key = key_string(key, path)?;
        if GROUP_KEYS.contains(&key.as_str()) {
            continue;
        }
        let child_path = format!("{}/{}", path, key);
        match value {
            Yaml::Mapping(child) if child.contains_key("value") => {
                group
                    .children
                    .push(SchemaNode::Dataset(parse_dataset(&key, &child_path, child)?));
            }
            Yaml::Mapping(child) => {
                group
                    .children
                    .push(SchemaNode::Group(parse_group(&key, &child_path, child)?));
            }
            other => group.attrs.push((key, to_json(other, &child_path)?)),
        }
    }

    if let Some(attrs) = mapping.get("attrs") {
        let mut declared = parse_attrs(attrs, &format!("{}/attrs", path))?;
        declared.append(&mut group.attrs);
        group.attrs = declared;
    }
    if let Some(attributes) = mapping.get("attributes") {
        group.attributes = parse_attributes(attributes, path)?;
    }
    Ok(group)
}

fn parse_dataset(name: &str, path: &str, mapping: &Mapping) -> Result<DatasetNode, SchemaError> {
    check_keys(mapping, &DATASET_KEYS, path)?;

    let nxclass = required_string(mapping, "nxclass", path, SchemaErrorKind::MissingNxclass)?;
    let value = mapping
        .get("value")
        .map(|raw| to_json(raw, path))
        .transpose()?
        .map(SchemaValue::from_raw)
        .ok_or_else(|| SchemaError::new(SchemaErrorKind::Syntax, path, "dataset requires a value"))?;

    let transformation = mapping
        .get("transformation")
        .map(|raw| parse_transformation(raw, &format!("{}/transformation", path)))
        .transpose()?;

    Ok(DatasetNode {
        name: name.to_string(),
        nxclass,
        value,
        dtype: parse_dtype(mapping, path)?,
        shape: parse_shape(mapping, path)?,
        attributes: match mapping.get("attributes") {
            Some(attributes) => parse_attributes(attributes, path)?,
            None => Vec::new(),
        },
        attrs: match mapping.get("attrs") {
            Some(attrs) => parse_attrs(attrs, &format!("{}/attrs", path))?,
            None => Vec::new(),
        },
        transformation,
    })
}

fn parse_attributes(value: &Yaml, path: &str) -> Result<Vec<AttributeNode>, SchemaError> {
    let mapping = expect_mapping(value, &format!("{}/attributes", path))?;
    let mut attributes = Vec::with_capacity(mapping.len());
    for (key, raw) in mapping {
        let name = key_string(key, path)?;
        let attribute_path = format!("{}@{}", path, name);
        let spec = expect_mapping(raw, &attribute_path)?;
        check_keys(spec, &ATTRIBUTE_KEYS, &attribute_path)?;

        let value = spec
            .get("value")
            .map(|raw| to_json(raw, &attribute_path))
            .transpose()?
            .map(SchemaValue::from_raw)
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::Syntax,
                    &attribute_path,
                    "attribute requires a value",
                )
            })?;

        attributes.push(AttributeNode {
            name,
            value,
            dtype: parse_dtype(spec, &attribute_path)?,
        });
    }
    Ok(attributes)
}

fn parse_attrs(value: &Yaml, path: &str) -> Result<Attrs, SchemaError> {
    expect_mapping(value, path)?
        .iter()
        .map(|(key, raw)| Ok((key_string(key, path)?, to_json(raw, path)?)))
        .collect()
}

fn parse_transformation(value: &Yaml, path: &str) -> Result<Transformation, SchemaError> {
    let mapping = expect_mapping(value, path)?;
    check_keys(mapping, &TRANSFORMATION_KEYS, path)?;

    let invalid = |message: String| {
        SchemaError::new(SchemaErrorKind::InvalidTransformation, path, message)
    };
    let source = mapping
        .get("expression")
        .and_then(Yaml::as_str)
        .ok_or_else(|| invalid("expression must be a string".to_string()))?;
    let target = mapping
        .get("target")
        .and_then(Yaml::as_str)
        .unwrap_or(Transformation::VALUE_TARGET);
    if target != Transformation::VALUE_TARGET {
        return Err(invalid(format!(
            "unsupported target '{}', only '{}' can be transformed",
            target,
            Transformation::VALUE_TARGET
        )));
    }

    let expression = Expression::compile(source).map_err(|e| invalid(e.to_string()))?;
    Ok(Transformation {
        expression,
        target: target.to_string(),
    })
}

fn parse_dtype(mapping: &Mapping, path: &str) -> Result<Option<Dtype>, SchemaError> {
    match mapping.get("dtype") {
        None | Some(Yaml::Null) => Ok(None),
        Some(Yaml::String(name)) => name
            .parse::<Dtype>()
            .map(Some)
            .map_err(|message| SchemaError::new(SchemaErrorKind::InvalidDtype, path, message)),
        Some(other) => Err(SchemaError::new(
            SchemaErrorKind::InvalidDtype,
            path,
            format!("dtype must be a string, got {}", yaml_kind(other)),
        )),
    }
}

fn parse_shape(mapping: &Mapping, path: &str) -> Result<Option<Vec<usize>>, SchemaError> {
    let Some(raw) = mapping.get("shape") else {
        return Ok(None);
    };
    let invalid = || SchemaError::new(SchemaErrorKind::Syntax, path, "shape must be a list of non-negative integers");
    match raw {
        Yaml::Null => Ok(None),
        Yaml::Sequence(dims) => dims
            .iter()
            .map(|dim| dim.as_u64().and_then(|d| usize::try_from(d).ok()).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        _ => Err(invalid()),
    }
}

fn check_keys(mapping: &Mapping, allowed: &[&str], path: &str) -> Result<(), SchemaError> {
    for key in mapping.keys() {
        let key = key_string(key, path)?;
        if !allowed.contains(&key.as_str()) {
            return Err(SchemaError::new(
                SchemaErrorKind::UnexpectedKey,
                path,
                format!("unexpected key '{}', allowed: {}", key, allowed.join(", ")),
            ));
        }
    }
    Ok(())
}

fn required_string(
    mapping: &Mapping,
    key: &str,
    path: &str,
    kind: SchemaErrorKind,
) -> Result<String, SchemaError> {
    optional_string(mapping, key, path)?
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SchemaError::new(kind, path, format!("'{}' is required", key)))
}

fn optional_string(mapping: &Mapping, key: &str, path: &str) -> Result<Option<String>, SchemaError> {
    match mapping.get(key) {
        None | Some(Yaml::Null) => Ok(None),
        Some(Yaml::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(SchemaError::new(
            SchemaErrorKind::Syntax,
            path,
            format!("'{}' must be a string, got {}", key, yaml_kind(other)),
        )),
    }
}

fn expect_mapping<'a>(value: &'a Yaml, path: &str) -> Result<&'a Mapping, SchemaError> {
    value.as_mapping().ok_or_else(|| {
        SchemaError::new(
            SchemaErrorKind::Syntax,
            path,
            format!("expected a mapping, got {}", yaml_kind(value)),
        )
    })
}

fn key_string(key: &Yaml, path: &str) -> Result<String, SchemaError> {
    match key {
        Yaml::String(key) => Ok(key.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        other => Err(SchemaError::new(
            SchemaErrorKind::Syntax,
            path,
            format!("keys must be scalars, got {}", yaml_kind(other)),
        )),
    }
}

fn to_json(value: &Yaml, path: &str) -> Result<serde_json::Value, SchemaError> {
    serde_json::to_value(value)
        .map_err(|e| SchemaError::new(SchemaErrorKind::Syntax, path, e.to_string()))
}

fn yaml_kind(value: &Yaml) -> &'static str {
    match value {
        Yaml::Null => "null",
        Yaml::Bool(_) => "a boolean",
        Yaml::Number(_) => "a number",
        Yaml::String(_) => "a string",
        Yaml::Sequence(_) => "a list",
        Yaml::Mapping(_) => "a mapping",
        Yaml::Tagged(_) => "a tagged value",
    }
}
