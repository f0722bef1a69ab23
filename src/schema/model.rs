//! Typed schema tree.

use crate::dtype::Dtype;
use crate::placeholder::Placeholder;
use crate::transform::Expression;
use serde_json::Value;

/// User-defined attributes in declaration order. Never contract-checked.
pub type Attrs = Vec<(String, Value)>;

/// Value slot of a dataset or attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaValue {
    Placeholder(Placeholder),
    Literal(Value),
}

impl SchemaValue {
    /// Strings that parse as placeholders become placeholders; anything else is literal.
    pub fn from_raw(raw: Value) -> Self {
        match &raw {
            Value::String(text) => match Placeholder::parse(text) {
                Some(placeholder) => SchemaValue::Placeholder(placeholder),
                None => SchemaValue::Literal(raw),
            },
            _ => SchemaValue::Literal(raw),
        }
    }

    pub fn placeholder(&self) -> Option<&Placeholder> {
        match self {
            SchemaValue::Placeholder(placeholder) => Some(placeholder),
            SchemaValue::Literal(_) => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, SchemaValue::Literal(_))
    }
}

/// Transformation applied to a dataset's resolved value before coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    pub expression: Expression,
    pub target: String,
}

impl Transformation {
    pub const VALUE_TARGET: &'static str = "value";
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeNode {
    pub name: String,
    pub value: SchemaValue,
    pub dtype: Option<Dtype>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetNode {
    pub name: String,
    pub nxclass: String,
    pub value: SchemaValue,
    pub dtype: Option<Dtype>,
    pub shape: Option<Vec<usize>>,
    pub attributes: Vec<AttributeNode>,
    pub attrs: Attrs,
    pub transformation: Option<Transformation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupNode {
    pub name: String,
    pub nxclass: String,
    /// Contract governing this group's children.
    pub nx_model: Option<String>,
    /// Value of the NeXus `default` attribute.
    pub default: Option<String>,
    pub attributes: Vec<AttributeNode>,
    pub attrs: Attrs,
    pub children: Vec<SchemaNode>,
}

impl GroupNode {
    pub fn new(name: impl Into<String>, nxclass: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nxclass: nxclass.into(),
            nx_model: None,
            default: None,
            attributes: Vec::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&SchemaNode> {
        self.children.iter().find(|child| child.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Group(GroupNode),
    Dataset(DatasetNode),
    Attribute(AttributeNode),
}

impl SchemaNode {
    pub fn name(&self) -> &str {
        match self {
            SchemaNode::Group(group) => &group.name,
            SchemaNode::Dataset(dataset) => &dataset.name,
            SchemaNode::Attribute(attribute) => &attribute.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SchemaNode::Group(_) => "group",
            SchemaNode::Dataset(_) => "dataset",
            SchemaNode::Attribute(_) => "attribute",
        }
    }
}

/// The schema of one device: a root group named after the device.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaModel {
    pub device: String,
    pub root: GroupNode,
}

impl SchemaModel {
    /// Every placeholder in the tree with the slash-separated path of its node.
    pub fn placeholders(&self) -> Vec<(String, &Placeholder)> {
        let mut found = Vec::new();
        collect_group(&self.root, &self.device, &mut found);
        found
    }

    pub fn pre_run_placeholders(&self) -> Vec<(String, &Placeholder)> {
        self.placeholders()
            .into_iter()
            .filter(|(_, placeholder)| placeholder.is_pre_run())
            .collect()
    }
}

fn collect_attributes<'a>(
    attributes: &'a [AttributeNode],
    path: &str,
    found: &mut Vec<(String, &'a Placeholder)>,
) {
    for attribute in attributes {
        if let Some(placeholder) = attribute.value.placeholder() {
            found.push((format!("{}@{}", path, attribute.name), placeholder));
        }
    }
}

fn collect_group<'a>(group: &'a GroupNode, path: &str, found: &mut Vec<(String, &'a Placeholder)>) {
    collect_attributes(&group.attributes, path, found);
    for child in &group.children {
        let child_path = format!("{}/{}", path, child.name());
        match child {
            SchemaNode::Group(inner) => collect_group(inner, &child_path, found),
            SchemaNode::Dataset(dataset) => {
                if let Some(placeholder) = dataset.value.placeholder() {
                    found.push((child_path.clone(), placeholder));
                }
                collect_attributes(&dataset.attributes, &child_path, found);
            }
            SchemaNode::Attribute(attribute) => {
                if let Some(placeholder) = attribute.value.placeholder() {
                    found.push((format!("{}@{}", path, attribute.name), placeholder));
                }
            }
        }
    }
}
