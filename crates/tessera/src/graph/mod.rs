//! Dataflow graph arena: node and value-descriptor storage, topology
//! queries, and the mutation primitives the partitioner and transform passes
//! are built on.
//!
//! Identity is index-based throughout. Nodes and value descriptors live in
//! graph-owned arenas and are referred to by [`NodeIndex`] / [`ArgId`]; claims
//! and assignments are plain index sets, so comparing them for overlap never
//! touches node storage. Node indices are never reused after removal.
//!
//! The graph tracks a mutation version. [`Graph::resolve`] records the
//! version it validated, so resolving an unmodified graph is a no-op; any
//! mutation (topology, shapes, initializers, assignments) bumps the version
//! and forces the next resolve to re-validate.

pub mod node;
pub mod types;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::provider::BackendId;

pub use node::{ArgId, AttributeValue, Node, NodeArg, NodeIndex};
pub use types::{DType, DimSymbol, Dimension, Shape, TensorLiteral, TensorSpec};

/// Domain name of the built-in operator set.
pub const DEFAULT_DOMAIN: &str = "";

/// Structural failure reported by [`Graph::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("graph contains a cycle through node {node}")]
    Cycle { node: NodeIndex },
    #[error("input '{arg}' of node {node} ({op_type}) has no producer, graph input, or initializer")]
    MissingProducer {
        node: NodeIndex,
        op_type: String,
        arg: String,
    },
    #[error("value '{arg}' is produced by both node {first} and node {second}")]
    DuplicateProducer {
        arg: String,
        first: NodeIndex,
        second: NodeIndex,
    },
    #[error("value '{arg}' is referenced without a recorded element type")]
    UntypedValue { arg: String },
    #[error("initializer '{name}' disagrees with its value descriptor: {detail}")]
    InitializerMismatch { name: String, detail: String },
}

/// Mutation failure on an individual graph operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    UnknownNode(NodeIndex),
    #[error("sentinel nodes cannot be removed")]
    SentinelRemoval,
    #[error("initializer '{0}' is already registered; remove it before adding a replacement")]
    InitializerExists(String),
}

/// Boundary annotation on an edge whose producer and consumer are assigned to
/// different backends: the execution-plan builder must schedule a data
/// transfer here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferEdge {
    pub producer: NodeIndex,
    pub consumer: NodeIndex,
    pub arg: ArgId,
}

/// A multi-node unit committed to one backend as a single indivisible step.
/// Internal edges stay intact; only the boundary values listed here are
/// visible to neighboring partitions.
#[derive(Debug, Clone)]
pub struct FusedGroup {
    pub backend: BackendId,
    pub name: String,
    pub nodes: Vec<NodeIndex>,
    pub boundary_inputs: Vec<ArgId>,
    pub boundary_outputs: Vec<ArgId>,
}

/// The DAG container.
pub struct Graph {
    nodes: Vec<Option<Node>>,
    args: Vec<NodeArg>,
    arg_ids: HashMap<String, ArgId>,
    initializers: HashMap<String, TensorLiteral>,
    graph_inputs: Vec<ArgId>,
    graph_outputs: Vec<ArgId>,
    source: NodeIndex,
    sink: NodeIndex,
    topo_order: Vec<NodeIndex>,
    producers: HashMap<ArgId, NodeIndex>,
    transfers: HashSet<TransferEdge>,
    fused_groups: Vec<FusedGroup>,
    version: u64,
    resolved_version: Option<u64>,
}

impl Graph {
    /// Constructs an empty graph holding only the source and sink sentinels.
    pub fn new() -> Self {
        let mut graph = Graph {
            nodes: Vec::new(),
            args: Vec::new(),
            arg_ids: HashMap::new(),
            initializers: HashMap::new(),
            graph_inputs: Vec::new(),
            graph_outputs: Vec::new(),
            source: NodeIndex(0),
            sink: NodeIndex(0),
            topo_order: Vec::new(),
            producers: HashMap::new(),
            transfers: HashSet::new(),
            fused_groups: Vec::new(),
            version: 0,
            resolved_version: None,
        };
        graph.source = graph.push_node("_source", "_Source", DEFAULT_DOMAIN, 1, &[], &[]);
        graph.sink = graph.push_node("_sink", "_Sink", DEFAULT_DOMAIN, 1, &[], &[]);
        graph
    }

    fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    // ---- value descriptors -------------------------------------------------

    /// Returns the descriptor id for `name`, creating it when absent. An
    /// existing descriptor is returned untouched.
    pub fn add_arg(
        &mut self,
        name: impl Into<String>,
        dtype: Option<DType>,
        shape: Option<Shape>,
    ) -> ArgId {
        let name = name.into();
        if let Some(id) = self.arg_ids.get(&name) {
            return *id;
        }
        let id = ArgId(self.args.len());
        self.args.push(NodeArg::new(name.clone(), dtype, shape));
        self.arg_ids.insert(name, id);
        self.bump_version();
        id
    }

    pub fn arg(&self, id: ArgId) -> &NodeArg {
        &self.args[id.0]
    }

    /// Mutable descriptor access; shape/type edits must stay consistent with
    /// every referencing node and are re-checked by the next `resolve`.
    pub fn arg_mut(&mut self, id: ArgId) -> &mut NodeArg {
        self.bump_version();
        &mut self.args[id.0]
    }

    pub fn arg_id(&self, name: &str) -> Option<ArgId> {
        self.arg_ids.get(name).copied()
    }

    // ---- nodes -------------------------------------------------------------

    fn push_node(
        &mut self,
        name: &str,
        op_type: &str,
        domain: &str,
        version: u32,
        inputs: &[ArgId],
        outputs: &[ArgId],
    ) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Some(Node::new(
            index,
            name,
            op_type,
            domain,
            version,
            inputs.iter().copied(),
            outputs.iter().copied(),
            BTreeMap::new(),
        )));
        self.bump_version();
        index
    }

    /// Adds an operator node without attributes.
    pub fn add_node(
        &mut self,
        name: &str,
        op_type: &str,
        domain: &str,
        version: u32,
        inputs: &[ArgId],
        outputs: &[ArgId],
    ) -> NodeIndex {
        self.push_node(name, op_type, domain, version, inputs, outputs)
    }

    /// Adds an operator node carrying an attribute map.
    #[allow(clippy::too_many_arguments)]
    pub fn add_node_with_attributes(
        &mut self,
        name: &str,
        op_type: &str,
        domain: &str,
        version: u32,
        inputs: &[ArgId],
        outputs: &[ArgId],
        attributes: BTreeMap<String, AttributeValue>,
    ) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Some(Node::new(
            index,
            name,
            op_type,
            domain,
            version,
            inputs.iter().copied(),
            outputs.iter().copied(),
            attributes,
        )));
        self.bump_version();
        index
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0).and_then(|slot| slot.as_ref())
    }

    /// Iterates live nodes (sentinels included) in stable index order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// Number of live operator nodes, sentinels excluded.
    pub fn op_node_count(&self) -> usize {
        self.nodes()
            .filter(|node| !self.is_sentinel(node.index()))
            .count()
    }

    pub fn is_source(&self, index: NodeIndex) -> bool {
        index == self.source
    }

    pub fn is_sink(&self, index: NodeIndex) -> bool {
        index == self.sink
    }

    pub fn is_sentinel(&self, index: NodeIndex) -> bool {
        self.is_source(index) || self.is_sink(index)
    }

    /// Removes a node; its index is retired and never reused.
    pub fn remove_node(&mut self, index: NodeIndex) -> Result<(), GraphError> {
        if self.is_sentinel(index) {
            return Err(GraphError::SentinelRemoval);
        }
        let slot = self
            .nodes
            .get_mut(index.0)
            .ok_or(GraphError::UnknownNode(index))?;
        if slot.take().is_none() {
            return Err(GraphError::UnknownNode(index));
        }
        self.bump_version();
        Ok(())
    }

    /// Rewires every node input referencing `from` to reference `to`.
    /// Returns the number of input slots rewired.
    pub fn rewire_consumers(&mut self, from: ArgId, to: ArgId) -> usize {
        let mut rewired = 0;
        for slot in self.nodes.iter_mut().flatten() {
            rewired += slot.replace_input(from, to);
        }
        if rewired > 0 {
            self.bump_version();
        }
        rewired
    }

    // ---- graph inputs/outputs ---------------------------------------------

    pub fn set_graph_inputs(&mut self, inputs: Vec<ArgId>) {
        self.graph_inputs = inputs;
        self.bump_version();
    }

    pub fn set_graph_outputs(&mut self, outputs: Vec<ArgId>) {
        self.graph_outputs = outputs;
        self.bump_version();
    }

    pub fn graph_inputs(&self) -> &[ArgId] {
        &self.graph_inputs
    }

    pub fn graph_outputs(&self) -> &[ArgId] {
        &self.graph_outputs
    }

    // ---- initializers ------------------------------------------------------

    /// Registers a named constant tensor. Replacement is wholesale: remove the
    /// existing entry first, then add the new one.
    pub fn add_initializer(
        &mut self,
        name: impl Into<String>,
        value: TensorLiteral,
    ) -> Result<(), GraphError> {
        let name = name.into();
        if self.initializers.contains_key(&name) {
            return Err(GraphError::InitializerExists(name));
        }
        self.initializers.insert(name, value);
        self.bump_version();
        Ok(())
    }

    pub fn initializer(&self, name: &str) -> Option<&TensorLiteral> {
        self.initializers.get(name)
    }

    pub fn remove_initializer(&mut self, name: &str) -> Option<TensorLiteral> {
        let removed = self.initializers.remove(name);
        if removed.is_some() {
            self.bump_version();
        }
        removed
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    // ---- topology queries --------------------------------------------------

    /// Node producing `arg`, if any. Valid after a successful `resolve`.
    pub fn producer_of(&self, arg: ArgId) -> Option<NodeIndex> {
        self.producers.get(&arg).copied()
    }

    /// Nodes consuming `arg`, in stable index order.
    pub fn consumers_of(&self, arg: ArgId) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|node| node.inputs().contains(&arg))
            .map(|node| node.index())
            .collect()
    }

    /// Number of this node's inputs fed by another node (rather than a graph
    /// input or initializer). Valid after a successful `resolve`.
    pub fn input_edge_count(&self, index: NodeIndex) -> usize {
        let Some(node) = self.node(index) else {
            return 0;
        };
        node.inputs()
            .iter()
            .filter(|arg| self.producers.contains_key(*arg))
            .count()
    }

    /// Topological execution order over operator nodes, sentinels excluded.
    /// Valid after a successful `resolve`.
    pub fn topological_order(&self) -> &[NodeIndex] {
        &self.topo_order
    }

    // ---- resolve -----------------------------------------------------------

    /// Re-validates the graph: rebuilds the producer index, checks every
    /// non-source input against producers/graph-inputs/initializers, checks
    /// value typing and initializer consistency, and recomputes topological
    /// order. A no-op when nothing changed since the last successful resolve.
    pub fn resolve(&mut self) -> Result<(), ResolveError> {
        if self.resolved_version == Some(self.version) {
            trace!("graph unchanged since last resolve; skipping");
            return Ok(());
        }

        let mut producers: HashMap<ArgId, NodeIndex> = HashMap::new();
        for node in self.nodes.iter().flatten() {
            if self.is_sentinel(node.index()) {
                continue;
            }
            for output in node.outputs() {
                if let Some(first) = producers.insert(*output, node.index()) {
                    return Err(ResolveError::DuplicateProducer {
                        arg: self.args[output.0].name().to_string(),
                        first,
                        second: node.index(),
                    });
                }
            }
        }

        let graph_inputs: HashSet<ArgId> = self.graph_inputs.iter().copied().collect();
        for node in self.nodes.iter().flatten() {
            if self.is_sentinel(node.index()) {
                continue;
            }
            for input in node.inputs() {
                let arg = &self.args[input.0];
                if producers.contains_key(input)
                    || graph_inputs.contains(input)
                    || self.initializers.contains_key(arg.name())
                {
                    continue;
                }
                return Err(ResolveError::MissingProducer {
                    node: node.index(),
                    op_type: node.op_type().to_string(),
                    arg: arg.name().to_string(),
                });
            }
        }

        for node in self.nodes.iter().flatten() {
            if self.is_sentinel(node.index()) {
                continue;
            }
            for arg_id in node.inputs().iter().chain(node.outputs()) {
                let arg = &self.args[arg_id.0];
                if arg.dtype().is_none() {
                    return Err(ResolveError::UntypedValue {
                        arg: arg.name().to_string(),
                    });
                }
            }
        }

        for (name, literal) in &self.initializers {
            let Some(arg_id) = self.arg_ids.get(name) else {
                continue;
            };
            let arg = &self.args[arg_id.0];
            if let Some(dtype) = arg.dtype() {
                if dtype != literal.spec.dtype {
                    return Err(ResolveError::InitializerMismatch {
                        name: name.clone(),
                        detail: format!(
                            "descriptor records {dtype}, constant holds {}",
                            literal.spec.dtype
                        ),
                    });
                }
            }
            if let Some(shape) = arg.shape() {
                if let (Some(arg_dims), Some(lit_dims)) =
                    (shape.static_dims(), literal.spec.shape.static_dims())
                {
                    if arg_dims != lit_dims {
                        return Err(ResolveError::InitializerMismatch {
                            name: name.clone(),
                            detail: format!(
                                "descriptor records shape {arg_dims:?}, constant holds {lit_dims:?}"
                            ),
                        });
                    }
                }
            }
        }

        self.topo_order = self.kahn_order(&producers)?;
        self.producers = producers;
        self.resolved_version = Some(self.version);
        trace!(nodes = self.topo_order.len(), "graph resolved");
        Ok(())
    }

    fn kahn_order(
        &self,
        producers: &HashMap<ArgId, NodeIndex>,
    ) -> Result<Vec<NodeIndex>, ResolveError> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        let mut successors: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();

        for node in self.nodes.iter().flatten() {
            if self.is_sentinel(node.index()) {
                continue;
            }
            in_degree.entry(node.index()).or_insert(0);
            for input in node.inputs() {
                if let Some(producer) = producers.get(input) {
                    *in_degree.entry(node.index()).or_insert(0) += 1;
                    successors.entry(*producer).or_default().push(node.index());
                }
            }
        }

        // Smallest ready index first, so the order is deterministic across
        // hash-map iteration orders.
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(*index))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            if let Some(next) = successors.get(&index) {
                for consumer in next {
                    let degree = in_degree
                        .get_mut(consumer)
                        .expect("consumer missing from in-degree table");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*consumer));
                    }
                }
            }
        }

        if order.len() != in_degree.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(index, _)| *index)
                .min()
                .expect("cycle detected but no node with remaining in-degree");
            return Err(ResolveError::Cycle { node: stuck });
        }

        Ok(order)
    }

    // ---- partition bookkeeping (crate-internal) ----------------------------

    pub(crate) fn set_node_backend(&mut self, index: NodeIndex, backend: Option<BackendId>) {
        if let Some(Some(node)) = self.nodes.get_mut(index.0) {
            node.set_assigned_backend(backend);
            self.bump_version();
        }
    }

    pub(crate) fn assignment_snapshot(&self) -> Vec<(NodeIndex, Option<BackendId>)> {
        self.nodes()
            .map(|node| (node.index(), node.assigned_backend().cloned()))
            .collect()
    }

    pub(crate) fn restore_assignments(&mut self, snapshot: Vec<(NodeIndex, Option<BackendId>)>) {
        for (index, backend) in snapshot {
            self.set_node_backend(index, backend);
        }
    }

    pub(crate) fn mark_transfer(&mut self, edge: TransferEdge) {
        self.transfers.insert(edge);
    }

    pub(crate) fn clear_transfers(&mut self) -> HashSet<TransferEdge> {
        std::mem::take(&mut self.transfers)
    }

    pub(crate) fn restore_transfers(&mut self, transfers: HashSet<TransferEdge>) {
        self.transfers = transfers;
    }

    pub(crate) fn record_fused_group(&mut self, group: FusedGroup) {
        self.fused_groups.push(group);
    }

    pub(crate) fn fused_group_count(&self) -> usize {
        self.fused_groups.len()
    }

    pub(crate) fn truncate_fused_groups(&mut self, len: usize) {
        self.fused_groups.truncate(len);
    }

    // ---- partition results -------------------------------------------------

    /// Cross-backend transfer markers recorded by the last successful
    /// partition pass.
    pub fn transfer_edges(&self) -> impl Iterator<Item = &TransferEdge> {
        self.transfers.iter()
    }

    pub fn is_transfer_edge(&self, producer: NodeIndex, consumer: NodeIndex) -> bool {
        self.transfers
            .iter()
            .any(|edge| edge.producer == producer && edge.consumer == consumer)
    }

    /// Fused groups committed by the last successful partition pass.
    pub fn fused_groups(&self) -> &[FusedGroup] {
        &self.fused_groups
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
