//! Capability-negotiation contract between the partitioner and execution
//! backends.
//!
//! One [`ExecutionProvider`] implementation exists per backend kind. The
//! partitioner consults providers in caller-declared preference order and
//! shows each one only the still-unassigned subgraph; a provider answers with
//! claims over stable node indices, optionally grouping several nodes into a
//! fused unit. Claims are purely advisory and consumed once.

use std::fmt;
use std::sync::Arc;

use crate::graph::{Graph, Node, NodeIndex};
use crate::kernel::KernelLookup;

/// Identifies one execution backend kind (e.g. `"cpu"`, `"simd"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Metadata attached to a multi-node claim executed as one indivisible unit.
#[derive(Debug, Clone)]
pub struct FusionInfo {
    /// Backend-chosen label for the fused unit (e.g. `"conv_relu"`).
    pub name: String,
}

/// A provider's declaration that it can execute a node set as one unit.
///
/// Granularity is backend policy: whole nodes or multi-node fused groups.
/// The partitioner only sees "this set of node indices, as one unit".
#[derive(Debug, Clone)]
pub struct CapabilityClaim {
    pub nodes: Vec<NodeIndex>,
    pub fusion: Option<FusionInfo>,
}

impl CapabilityClaim {
    pub fn single(node: NodeIndex) -> Self {
        Self {
            nodes: vec![node],
            fusion: None,
        }
    }

    pub fn fused(nodes: Vec<NodeIndex>, name: impl Into<String>) -> Self {
        Self {
            nodes,
            fusion: Some(FusionInfo { name: name.into() }),
        }
    }

    pub fn is_fused(&self) -> bool {
        self.fusion.is_some()
    }
}

/// Read-only view over the still-unassigned, non-sentinel subgraph offered to
/// one provider. Already-assigned nodes are never re-offered, which is how
/// earlier backends in the preference order win ties.
pub struct PartitionView<'g> {
    graph: &'g Graph,
    offered: Vec<NodeIndex>,
}

impl<'g> PartitionView<'g> {
    pub fn new(graph: &'g Graph, mut offered: Vec<NodeIndex>) -> Self {
        offered.sort();
        Self { graph, offered }
    }

    /// The full graph, for topology queries (producers, consumers, shapes).
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Offered nodes in stable index order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.offered
            .iter()
            .filter_map(|index| self.graph.node(*index))
    }

    pub fn contains(&self, index: NodeIndex) -> bool {
        self.offered.binary_search(&index).is_ok()
    }

    pub fn len(&self) -> usize {
        self.offered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offered.is_empty()
    }
}

/// Capability interface implemented once per backend kind.
pub trait ExecutionProvider: Send + Sync {
    /// The backend this provider executes on; doubles as the assignment tag
    /// written onto claimed nodes.
    fn backend_id(&self) -> &BackendId;

    /// Scans the offered subgraph and returns a claim for each node or node
    /// group this backend is willing and able to execute.
    ///
    /// Contract: a provider must only claim a node when
    /// `kernels.has_kernel(graph, node, self.backend_id())` holds. Claims
    /// within one response must be disjoint. No graph mutation.
    fn get_capability(
        &self,
        view: &PartitionView<'_>,
        kernels: &dyn KernelLookup,
    ) -> Vec<CapabilityClaim>;
}
