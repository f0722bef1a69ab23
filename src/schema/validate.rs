//! Contract validation of parsed schemas.

use super::contract::{ChildKind, Contract, ContractChild, ContractRegistry};
use super::model::{AttributeNode, DatasetNode, GroupNode, SchemaModel, SchemaNode};
use crate::error::{SchemaError, SchemaErrorKind};

/// Check `model` against the contracts in `registry`.
///
/// Returns the model with contract information filled in: sub-groups that the
/// contract binds to a model get that `nx_model`, and groups without an
/// explicit `default` take the contract's. Validating the result again
/// succeeds and returns it unchanged.
pub fn validate(mut model: SchemaModel, registry: &ContractRegistry) -> Result<SchemaModel, SchemaError> {
    let path = model.device.clone();
    validate_group(&mut model.root, &path, registry)?;
    Ok(model)
}

fn validate_group(group: &mut GroupNode, path: &str, registry: &ContractRegistry) -> Result<(), SchemaError> {
    if group.nxclass.is_empty() {
        return Err(SchemaError::new(
            SchemaErrorKind::MissingNxclass,
            path,
            "group has no nxclass",
        ));
    }

    let contract = match group.nx_model.as_deref() {
        Some(name) => Some(registry.get(name).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::UnknownModel,
                path,
                format!("unknown nx_model '{}'", name),
            )
        })?),
        None => None,
    };

    check_literal_dtypes(&group.attributes, path)?;
    if let Some(contract) = contract {
        if group.default.is_none() {
            group.default = contract.default.clone();
        }
        if !contract.open {
            check_attribute_names(&group.attributes, &contract.attributes, path, &contract.name)?;
        }
    }

    for child in group.children.iter_mut() {
        let child_path = format!("{}/{}", path, child.name());
        let spec = contract.and_then(|c| c.child(child.name(), matches!(child, SchemaNode::Group(_))));

        match child {
            SchemaNode::Group(inner) => {
                if let Some(spec) = spec {
                    let ChildKind::Group { model } = &spec.kind else {
                        return Err(kind_mismatch(&child_path, spec, "group"));
                    };
                    if inner.nx_model.is_none() {
                        inner.nx_model = model.clone();
                    }
                }
                validate_group(inner, &child_path, registry)?;
            }
            SchemaNode::Dataset(dataset) => {
                if let Some(spec) = spec {
                    if spec.kind != ChildKind::Dataset {
                        return Err(kind_mismatch(&child_path, spec, "dataset"));
                    }
                }
                validate_dataset(dataset, &child_path, spec)?;
            }
            SchemaNode::Attribute(attribute) => {
                check_literal_dtypes(std::slice::from_ref(attribute), path)?;
            }
        }
    }

    if let Some(contract) = contract {
        check_required_children(group, contract, path)?;
    }
    Ok(())
}

fn validate_dataset(
    dataset: &DatasetNode,
    path: &str,
    spec: Option<&ContractChild>,
) -> Result<(), SchemaError> {
    if dataset.nxclass.is_empty() {
        return Err(SchemaError::new(
            SchemaErrorKind::MissingNxclass,
            path,
            "dataset has no nxclass",
        ));
    }
    if dataset.value.is_literal() && dataset.dtype.is_none() {
        return Err(SchemaError::new(
            SchemaErrorKind::MissingDtype,
            path,
            "a literal value requires an explicit dtype",
        ));
    }
    check_literal_dtypes(&dataset.attributes, path)?;

    if let Some(spec) = spec {
        check_attribute_names(&dataset.attributes, &spec.attributes, path, spec.name.display())?;
        if !dataset.attributes.is_empty() {
            for required in spec.attributes.iter().filter(|a| a.required) {
                if !dataset.attributes.iter().any(|a| a.name == required.name) {
                    return Err(SchemaError::new(
                        SchemaErrorKind::ContractViolation,
                        path,
                        format!(
                            "attribute '{}' is mandatory for {}",
                            required.name,
                            spec.name.display()
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn check_literal_dtypes(attributes: &[AttributeNode], path: &str) -> Result<(), SchemaError> {
    match attributes
        .iter()
        .find(|attribute| attribute.value.is_literal() && attribute.dtype.is_none())
    {
        Some(attribute) => Err(SchemaError::new(
            SchemaErrorKind::MissingDtype,
            format!("{}@{}", path, attribute.name),
            "a literal value requires an explicit dtype",
        )),
        None => Ok(()),
    }
}

fn check_attribute_names(
    attributes: &[AttributeNode],
    allowed: &[super::contract::AttributeSpec],
    path: &str,
    owner: &str,
) -> Result<(), SchemaError> {
    for attribute in attributes {
        if !allowed.iter().any(|spec| spec.name == attribute.name) {
            return Err(SchemaError::new(
                SchemaErrorKind::ContractViolation,
                format!("{}@{}", path, attribute.name),
                format!("{} declares no attribute '{}'", owner, attribute.name),
            ));
        }
    }
    Ok(())
}

fn check_required_children(group: &GroupNode, contract: &Contract, path: &str) -> Result<(), SchemaError> {
    for required in contract.required_children() {
        let is_group = matches!(required.kind, ChildKind::Group { .. });
        let present = group.children.iter().any(|child| {
            required.name.matches(child.name())
                && matches!(child, SchemaNode::Group(_)) == is_group
        });
        if !present {
            return Err(SchemaError::new(
                SchemaErrorKind::ContractViolation,
                path,
                format!(
                    "{} requires {} '{}'",
                    contract.name,
                    if is_group { "group" } else { "dataset" },
                    required.name.display()
                ),
            ));
        }
    }
    Ok(())
}

fn kind_mismatch(path: &str, spec: &ContractChild, found: &str) -> SchemaError {
    let expected = match spec.kind {
        ChildKind::Dataset => "dataset",
        ChildKind::Group { .. } => "group",
    };
    SchemaError::new(
        SchemaErrorKind::ContractViolation,
        path,
        format!("'{}' must be a {}, found a {}", spec.name.display(), expected, found),
    )
}
