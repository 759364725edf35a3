//! Node and value-descriptor storage for the graph arena.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::provider::BackendId;

use super::types::{DType, Shape};

/// Stable identifier of a node within one graph. Indices are assigned in
/// insertion order and never reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identifier of a value descriptor in the graph's identity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgId(pub usize);

/// Attribute payload attached to a node.
///
/// Attributes are limited to simple primitives and arrays so they are easy to
/// serialize, hash, and validate across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum AttributeValue {
    I64(i64),
    F64(f64),
    String(String),
    I64Array(Vec<i64>),
    F64Array(Vec<f64>),
    StringArray(Vec<String>),
}

impl AttributeValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::I64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64_array(&self) -> Option<&[i64]> {
        match self {
            AttributeValue::I64Array(values) => Some(values),
            _ => None,
        }
    }
}

/// A named, typed, shaped tensor slot referenced by one producing node and
/// zero-or-more consumers. Identity lives in the graph's table; nodes refer
/// to it by [`ArgId`].
#[derive(Debug, Clone)]
pub struct NodeArg {
    name: String,
    dtype: Option<DType>,
    shape: Option<Shape>,
}

impl NodeArg {
    pub(super) fn new(name: impl Into<String>, dtype: Option<DType>, shape: Option<Shape>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    /// Overwrites the recorded shape. Shape updates must stay consistent with
    /// every node referencing this descriptor; `Graph::resolve` re-checks.
    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = Some(shape);
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        self.dtype = Some(dtype);
    }
}

/// An operator instance owned by the graph.
#[derive(Debug, Clone)]
pub struct Node {
    index: NodeIndex,
    name: String,
    op_type: String,
    domain: String,
    version: u32,
    inputs: SmallVec<[ArgId; 4]>,
    outputs: SmallVec<[ArgId; 2]>,
    attributes: BTreeMap<String, AttributeValue>,
    assigned_backend: Option<BackendId>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        index: NodeIndex,
        name: impl Into<String>,
        op_type: impl Into<String>,
        domain: impl Into<String>,
        version: u32,
        inputs: impl IntoIterator<Item = ArgId>,
        outputs: impl IntoIterator<Item = ArgId>,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            op_type: op_type.into(),
            domain: domain.into(),
            version,
            inputs: inputs.into_iter().collect(),
            outputs: outputs.into_iter().collect(),
            attributes,
            assigned_backend: None,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Opset version this node was authored against; kernel lookup matches it
    /// against each registered signature's version range.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn inputs(&self) -> &[ArgId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgId] {
        &self.outputs
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Backend this node was committed to by a successful partition pass, if
    /// any.
    pub fn assigned_backend(&self) -> Option<&BackendId> {
        self.assigned_backend.as_ref()
    }

    pub(super) fn set_assigned_backend(&mut self, backend: Option<BackendId>) {
        self.assigned_backend = backend;
    }

    /// Rewires every occurrence of `from` in this node's input list to `to`.
    /// Returns the number of slots rewired.
    pub(super) fn replace_input(&mut self, from: ArgId, to: ArgId) -> usize {
        let mut replaced = 0;
        for slot in self.inputs.iter_mut() {
            if *slot == from {
                *slot = to;
                replaced += 1;
            }
        }
        replaced
    }
}
