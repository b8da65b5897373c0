//! Dissection capability consumed by the state mapper, exclusion engine and
//! mutation engine.
//!
//! Protocol decoding lives outside this workspace. An adapter around the
//! external dissector implements [`DissectorFactory`] (load-time filter and
//! field compilation) and [`Dissector`] (per-thread decoding of packets into
//! a [`PacketTree`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Whether the intercepted packet is being sent or has been received by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Tx,
    Rx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Tx => f.write_str("TX"),
            Direction::Rx => f.write_str("RX"),
        }
    }
}

/// Opaque handle to a compiled display filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(pub u32);

/// Opaque handle to a resolved protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle(pub u32);

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Uint(u64),
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Uint(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Bytes(b) => {
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A protocol layer boundary.
    Layer,
    /// A subtree that is not a layer (e.g. a structure or list).
    Group,
    /// A leaf with on-wire bytes.
    Field,
}

/// One node of the dissected tree. Offsets index the raw packet bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub name: String,
    pub kind: NodeKind,
    pub offset: usize,
    pub length: usize,
    pub value: Option<FieldValue>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn layer(name: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Layer,
            offset,
            length,
            value: None,
            children: Vec::new(),
        }
    }

    pub fn field(name: impl Into<String>, offset: usize, length: usize, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Field,
            offset,
            length,
            value: Some(value),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TreeNode>) -> Self {
        self.children = children;
        self
    }

    /// Depth-first search for the first node named `name`.
    pub fn find(&self, name: &str) -> Option<&TreeNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Depth-first search for the first leaf field named `name`.
    pub fn find_field(&self, name: &str) -> Option<&TreeNode> {
        if self.kind == NodeKind::Field && self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_field(name))
    }
}

/// Result of dissecting one packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketTree {
    pub direction: Direction,
    /// Top-level nodes, normally one per protocol layer.
    pub nodes: Vec<TreeNode>,
    /// The dissector flagged the packet as malformed.
    pub malformed: bool,
    pub summary: String,
}

impl PacketTree {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            nodes: Vec::new(),
            malformed: false,
            summary: String::new(),
        }
    }

    /// Number of protocol layers in the packet.
    pub fn layer_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Layer).count()
    }

    pub fn find(&self, name: &str) -> Option<&TreeNode> {
        self.nodes.iter().find_map(|n| n.find(name))
    }

    pub fn find_field(&self, name: &str) -> Option<&TreeNode> {
        self.nodes.iter().find_map(|n| n.find_field(name))
    }
}

/// Load-time half of the dissection capability.
///
/// Handles returned here are valid for every [`Dissector`] the factory creates.
pub trait DissectorFactory: Send + Sync {
    fn compile_filter(&self, expr: &str) -> Result<FilterHandle, ModelError>;

    fn resolve_field(&self, name: &str) -> Result<FieldHandle, ModelError>;

    /// A fresh decoder for one channel thread.
    fn create(&self) -> Box<dyn Dissector>;
}

/// Per-thread half of the dissection capability.
pub trait Dissector: Send {
    /// Register filters and fields that will be read after every dissection.
    /// Decoders without such a concept ignore it.
    fn declare_interest(&mut self, _filters: &[FilterHandle], _fields: &[FieldHandle]) {}

    fn dissect(&mut self, packet: &[u8], direction: Direction) -> PacketTree;

    fn read_filter(&self, tree: &PacketTree, filter: FilterHandle) -> bool;

    fn read_field(&self, tree: &PacketTree, field: FieldHandle) -> Option<FieldValue>;

    /// One-line summary of the packet.
    fn summary(&self, tree: &PacketTree) -> String {
        tree.summary.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Tx.to_string(), "TX");
        assert_eq!(Direction::Rx.to_string(), "RX");
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Uint(7).to_string(), "7");
        assert_eq!(FieldValue::Str("setup".into()).to_string(), "setup");
        assert_eq!(FieldValue::Bytes(vec![0xde, 0xad]).to_string(), "de:ad");
    }

    #[test]
    fn test_layer_count_ignores_groups() {
        let mut tree = PacketTree::new(Direction::Rx);
        tree.nodes.push(TreeNode::layer("mac", 0, 4));
        tree.nodes.push(TreeNode::layer("rlc", 4, 4));
        tree.nodes.push(TreeNode {
            kind: NodeKind::Group,
            ..TreeNode::layer("padding", 8, 1)
        });
        assert_eq!(tree.layer_count(), 2);
    }

    #[test]
    fn test_find_descends_into_children() {
        let mut tree = PacketTree::new(Direction::Tx);
        tree.nodes.push(
            TreeNode::layer("rrc", 0, 2)
                .with_children(vec![TreeNode::field("rrc.type", 1, 1, FieldValue::Uint(3))]),
        );
        assert_eq!(tree.find("rrc.type").unwrap().offset, 1);
        assert!(tree.find("nas").is_none());
    }
}
