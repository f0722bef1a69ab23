//! In-memory sink that keeps the written tree inspectable after close.

use super::{NodeId, OutputSink};
use crate::coerce::TypedValue;
use crate::error::SinkError;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Group,
    Dataset(TypedValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryNode {
    pub name: String,
    pub kind: NodeKind,
    /// Attributes in creation order.
    pub attributes: Vec<(String, TypedValue)>,
    pub children: Vec<NodeId>,
}

impl MemoryNode {
    fn new(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }

    pub fn value(&self) -> Option<&TypedValue> {
        match &self.kind {
            NodeKind::Dataset(value) => Some(value),
            NodeKind::Group => None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&TypedValue> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unopened,
    Open,
    Closed,
}

/// Arena of nodes; index 0 is the root group.
#[derive(Debug, Clone)]
pub struct MemorySink {
    path: Option<PathBuf>,
    nodes: Vec<MemoryNode>,
    state: State,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            path: None,
            nodes: Vec::new(),
            state: State::Unopened,
        }
    }

    /// Path given to the last `open`.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn root(&self) -> Option<&MemoryNode> {
        self.nodes.first()
    }

    pub fn get(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(id.0)
    }

    /// Look up a node by slash-separated path; `""` is the root.
    pub fn node(&self, path: &str) -> Option<&MemoryNode> {
        let mut current = self.root()?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .children
                .iter()
                .filter_map(|id| self.get(*id))
                .find(|child| child.name == segment)?;
        }
        Some(current)
    }

    /// Value of the dataset at `path`.
    pub fn dataset(&self, path: &str) -> Option<&TypedValue> {
        self.node(path)?.value()
    }

    pub fn attribute(&self, path: &str, name: &str) -> Option<&TypedValue> {
        self.node(path)?.attribute(name)
    }

    /// Names of the children of the node at `path`, in creation order.
    pub fn children(&self, path: &str) -> Vec<&str> {
        self.node(path)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|id| self.get(*id))
                    .map(|child| child.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Render the tree as JSON.
    ///
    /// Groups become `{"name", "kind": "group", "attributes", "children"}`,
    /// datasets `{"name", "kind": "dataset", "dtype", "shape", "value", "attributes"}`.
    pub fn to_json(&self) -> Value {
        match self.root() {
            Some(_) => self.render(NodeId::ROOT),
            None => Value::Null,
        }
    }

    fn render(&self, id: NodeId) -> Value {
        let Some(node) = self.get(id) else {
            return Value::Null;
        };
        let mut attributes = Map::new();
        for (name, value) in &node.attributes {
            attributes.insert(name.clone(), value.to_json());
        }
        match &node.kind {
            NodeKind::Group => json!({
                "name": node.name,
                "kind": "group",
                "attributes": attributes,
                "children": node
                    .children
                    .iter()
                    .map(|child| self.render(*child))
                    .collect::<Vec<_>>(),
            }),
            NodeKind::Dataset(value) => json!({
                "name": node.name,
                "kind": "dataset",
                "dtype": value.dtype.as_str(),
                "shape": value.shape,
                "value": value.to_json(),
                "attributes": attributes,
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), SinkError> {
        match self.state {
            State::Open => Ok(()),
            State::Closed => Err(SinkError::Closed),
            State::Unopened => Err(SinkError::Backend("sink is not open".to_string())),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut MemoryNode, SinkError> {
        self.nodes.get_mut(id.0).ok_or(SinkError::UnknownHandle(id.0))
    }

    fn insert(&mut self, parent: NodeId, node: MemoryNode) -> Result<NodeId, SinkError> {
        self.ensure_open()?;
        let parent_node = self.nodes.get(parent.0).ok_or(SinkError::UnknownHandle(parent.0))?;
        if !parent_node.is_group() {
            return Err(SinkError::Backend(format!(
                "'{}' is a dataset and cannot hold children",
                parent_node.name
            )));
        }
        let duplicate = parent_node
            .children
            .iter()
            .filter_map(|id| self.nodes.get(id.0))
            .any(|child| child.name == node.name);
        if duplicate {
            return Err(SinkError::Duplicate(node.name));
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }
}

impl OutputSink for MemorySink {
    fn open(&mut self, path: &Path) -> Result<NodeId, SinkError> {
        self.path = Some(path.to_path_buf());
        self.nodes = vec![MemoryNode::new("", NodeKind::Group)];
        self.state = State::Open;
        Ok(NodeId::ROOT)
    }

    fn create_group(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SinkError> {
        self.insert(parent, MemoryNode::new(name, NodeKind::Group))
    }

    fn create_dataset(
        &mut self,
        parent: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<NodeId, SinkError> {
        self.insert(parent, MemoryNode::new(name, NodeKind::Dataset(value.clone())))
    }

    fn set_attribute(
        &mut self,
        node: NodeId,
        name: &str,
        value: &TypedValue,
    ) -> Result<(), SinkError> {
        self.ensure_open()?;
        let target = self.node_mut(node)?;
        if target.attribute(name).is_some() {
            return Err(SinkError::Duplicate(format!("{}@{}", target.name, name)));
        }
        target.attributes.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.ensure_open()?;
        self.state = State::Closed;
        Ok(())
    }
}
