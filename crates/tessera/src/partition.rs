//! Deterministic single-pass assignment of every operator node to exactly one
//! execution backend.
//!
//! Providers are consulted in caller-declared preference order (first wins
//! ties); each one sees only the still-unassigned subgraph. Claims are
//! validated, staged, and committed as a unit: assignments are written onto
//! the graph, fused groups and cross-backend transfer markers are recorded,
//! and the graph is re-resolved. A resolution failure rolls everything back,
//! leaving the graph in its pre-partition state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::{ArgId, FusedGroup, Graph, NodeIndex, ResolveError, TransferEdge};
use crate::kernel::{KernelLookup, KernelRegistryManager};
use crate::profiling::{EventCategory, Profiler};
use crate::provider::{BackendId, CapabilityClaim, ExecutionProvider, PartitionView};

/// Terminal partitioning failure. Local problems (a kernel missing on one
/// backend) are absorbed by moving on to the next provider; everything here
/// is structural and propagates to the caller with no partial assignment
/// left behind.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// A provider returned overlapping or already-assigned nodes in one
    /// response. Provider-implementation defect; not retried.
    #[error("provider {provider} returned an invalid capability claim: {detail}")]
    InvalidCapabilityClaim { provider: BackendId, detail: String },

    /// No configured backend, including the fallback, can execute this node.
    #[error(
        "node {node} ({op_type}, domain '{domain}') has no kernel on any \
         configured backend (attempted: {attempted:?})"
    )]
    UnassignableNode {
        node: NodeIndex,
        op_type: String,
        domain: String,
        attempted: Vec<BackendId>,
    },

    /// The post-assignment consistency re-check failed; every assignment was
    /// rolled back and the graph is usable in its prior state.
    #[error("graph resolution failed during partitioning; assignments rolled back")]
    GraphResolutionFailed {
        #[source]
        source: ResolveError,
    },
}

/// Outcome of a successful partition pass.
#[derive(Debug, Default)]
pub struct PartitionSummary {
    /// Committed node count per backend, fallback included.
    pub assignments: HashMap<BackendId, usize>,
    /// Nodes swept to the fallback backend after all providers passed.
    pub fallback_nodes: usize,
    /// Fused groups committed.
    pub fused_groups: usize,
    /// Cross-backend transfer markers recorded.
    pub transfer_edges: usize,
}

struct StagedGroup {
    backend: BackendId,
    name: String,
    nodes: Vec<NodeIndex>,
}

enum ProviderResponse {
    Accepted(Vec<CapabilityClaim>),
    Voided,
}

/// Maps abstract operator nodes onto concrete execution backends and
/// validates that every node in the final graph has an executable
/// implementation.
pub struct GraphPartitioner<'a> {
    kernels: &'a KernelRegistryManager,
    providers: &'a [Arc<dyn ExecutionProvider>],
    fallback: BackendId,
    profiler: Option<Arc<Profiler>>,
}

impl<'a> GraphPartitioner<'a> {
    /// The order of `providers` expresses caller preference: the first
    /// provider wins every tie. `fallback` names the backend assumed to have
    /// universal kernel coverage; nodes no provider claims are swept onto it.
    pub fn new(
        kernels: &'a KernelRegistryManager,
        providers: &'a [Arc<dyn ExecutionProvider>],
        fallback: BackendId,
    ) -> Self {
        Self {
            kernels,
            providers,
            fallback,
            profiler: None,
        }
    }

    /// Attaches an event sink recording per-provider capability-query timings
    /// and the whole-pass duration.
    pub fn with_profiler(mut self, profiler: Arc<Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Runs the partition pass and commits the result onto `graph`.
    pub fn partition(&self, graph: &mut Graph) -> Result<PartitionSummary, PartitionError> {
        let _pass_scope = self
            .profiler
            .as_ref()
            .map(|p| p.scope(EventCategory::Partition, "partition"));

        graph
            .resolve()
            .map_err(|source| PartitionError::GraphResolutionFailed { source })?;

        let mut staged: HashMap<NodeIndex, BackendId> = HashMap::new();
        let mut staged_groups: Vec<StagedGroup> = Vec::new();

        for provider in self.providers {
            let backend = provider.backend_id().clone();
            let offered = self.unassigned_nodes(graph, &staged);
            if offered.is_empty() {
                debug!(%backend, "no unassigned nodes left to offer");
                continue;
            }
            let view = PartitionView::new(graph, offered);

            let claims = {
                let _query_scope = self.profiler.as_ref().map(|p| {
                    p.scope(
                        EventCategory::Provider,
                        format!("get_capability::{backend}"),
                    )
                });
                provider.get_capability(&view, self.kernels)
            };
            debug!(%backend, claims = claims.len(), "provider answered capability query");

            match self.validate_response(graph, &view, claims, &backend)? {
                ProviderResponse::Voided => continue,
                ProviderResponse::Accepted(claims) => {
                    for claim in claims {
                        // Per-claim atomic: validation guaranteed none of
                        // these nodes is staged yet.
                        for node in &claim.nodes {
                            staged.insert(*node, backend.clone());
                        }
                        if claim.nodes.len() > 1 {
                            let name = claim
                                .fusion
                                .map(|info| info.name)
                                .unwrap_or_else(|| "fused".to_string());
                            staged_groups.push(StagedGroup {
                                backend: backend.clone(),
                                name,
                                nodes: claim.nodes,
                            });
                        }
                    }
                }
            }
        }

        let mut fallback_nodes = 0usize;
        for index in self.unassigned_nodes(graph, &staged) {
            let node = graph.node(index).expect("offered node disappeared");
            if self.kernels.has_kernel(graph, node, &self.fallback) {
                staged.insert(index, self.fallback.clone());
                fallback_nodes += 1;
                continue;
            }
            let mut attempted: Vec<BackendId> = self
                .providers
                .iter()
                .map(|provider| provider.backend_id().clone())
                .collect();
            if !attempted.contains(&self.fallback) {
                attempted.push(self.fallback.clone());
            }
            // Nothing was committed to the graph; assignment state is
            // untouched on this failure path.
            return Err(PartitionError::UnassignableNode {
                node: index,
                op_type: node.op_type().to_string(),
                domain: node.domain().to_string(),
                attempted,
            });
        }
        if fallback_nodes > 0 {
            debug!(
                backend = %self.fallback,
                nodes = fallback_nodes,
                "swept unclaimed nodes to the fallback backend"
            );
        }

        self.commit(graph, staged, staged_groups, fallback_nodes)
    }

    fn unassigned_nodes(
        &self,
        graph: &Graph,
        staged: &HashMap<NodeIndex, BackendId>,
    ) -> Vec<NodeIndex> {
        graph
            .nodes()
            .filter(|node| !graph.is_sentinel(node.index()))
            .filter(|node| node.assigned_backend().is_none())
            .filter(|node| !staged.contains_key(&node.index()))
            .map(|node| node.index())
            .collect()
    }

    /// Checks one provider's full response before anything is staged.
    /// Overlapping, out-of-view, or already-assigned nodes are a structural
    /// defect failing the whole partition; a claim for a node without a
    /// registered kernel voids this provider's response but lets the pass
    /// continue.
    fn validate_response(
        &self,
        graph: &Graph,
        view: &PartitionView<'_>,
        claims: Vec<CapabilityClaim>,
        backend: &BackendId,
    ) -> Result<ProviderResponse, PartitionError> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        for claim in &claims {
            if claim.nodes.is_empty() {
                return Err(PartitionError::InvalidCapabilityClaim {
                    provider: backend.clone(),
                    detail: "claim contains no nodes".to_string(),
                });
            }
            for node in &claim.nodes {
                if !view.contains(*node) {
                    return Err(PartitionError::InvalidCapabilityClaim {
                        provider: backend.clone(),
                        detail: format!("node {node} was not offered or is already assigned"),
                    });
                }
                if !seen.insert(*node) {
                    return Err(PartitionError::InvalidCapabilityClaim {
                        provider: backend.clone(),
                        detail: format!("node {node} appears in two claims of one response"),
                    });
                }
            }
        }

        for claim in &claims {
            for index in &claim.nodes {
                let node = graph.node(*index).expect("claimed node disappeared");
                if !self.kernels.has_kernel(graph, node, backend) {
                    warn!(
                        provider = %backend,
                        node = %index,
                        op_type = node.op_type(),
                        "provider claimed a node without a registered kernel; \
                         discarding its entire response"
                    );
                    return Ok(ProviderResponse::Voided);
                }
            }
        }

        Ok(ProviderResponse::Accepted(claims))
    }

    fn commit(
        &self,
        graph: &mut Graph,
        staged: HashMap<NodeIndex, BackendId>,
        staged_groups: Vec<StagedGroup>,
        fallback_nodes: usize,
    ) -> Result<PartitionSummary, PartitionError> {
        let snapshot = graph.assignment_snapshot();
        let prior_transfers = graph.clear_transfers();
        let prior_group_count = graph.fused_group_count();

        let mut assignments: HashMap<BackendId, usize> = HashMap::new();
        for (index, backend) in &staged {
            graph.set_node_backend(*index, Some(backend.clone()));
            *assignments.entry(backend.clone()).or_insert(0) += 1;
        }

        let fused_groups = staged_groups.len();
        for group in staged_groups {
            let (boundary_inputs, boundary_outputs) = group_boundaries(graph, &group.nodes);
            graph.record_fused_group(FusedGroup {
                backend: group.backend,
                name: group.name,
                nodes: group.nodes,
                boundary_inputs,
                boundary_outputs,
            });
        }

        let transfer_edges = mark_cross_backend_transfers(graph);

        if let Err(source) = graph.resolve() {
            graph.restore_assignments(snapshot);
            graph.restore_transfers(prior_transfers);
            graph.truncate_fused_groups(prior_group_count);
            // Re-validate so the rolled-back graph is in a known-consistent
            // topological state for the caller.
            let _ = graph.resolve();
            return Err(PartitionError::GraphResolutionFailed { source });
        }

        debug!(
            backends = assignments.len(),
            fused_groups, transfer_edges, "partition committed"
        );
        Ok(PartitionSummary {
            assignments,
            fallback_nodes,
            fused_groups,
            transfer_edges,
        })
    }
}

/// Splits a fused group's referenced values into boundary inputs (produced
/// outside the group, or graph inputs/initializers) and boundary outputs
/// (consumed outside the group, or graph outputs). Internal edges stay
/// invisible to neighboring partitions.
fn group_boundaries(graph: &Graph, nodes: &[NodeIndex]) -> (Vec<ArgId>, Vec<ArgId>) {
    let members: HashSet<NodeIndex> = nodes.iter().copied().collect();
    let mut boundary_inputs = Vec::new();
    let mut boundary_outputs = Vec::new();

    for index in nodes {
        let Some(node) = graph.node(*index) else {
            continue;
        };
        for input in node.inputs() {
            let produced_inside = graph
                .producer_of(*input)
                .is_some_and(|producer| members.contains(&producer));
            if !produced_inside && !boundary_inputs.contains(input) {
                boundary_inputs.push(*input);
            }
        }
        for output in node.outputs() {
            let consumed_outside = graph
                .consumers_of(*output)
                .iter()
                .any(|consumer| !members.contains(consumer));
            let is_graph_output = graph.graph_outputs().contains(output);
            if (consumed_outside || is_graph_output) && !boundary_outputs.contains(output) {
                boundary_outputs.push(*output);
            }
        }
    }

    (boundary_inputs, boundary_outputs)
}

/// Marks every edge whose producer and consumer committed to different
/// backends. The marker tells the execution-plan builder a data transfer is
/// required there; the partitioner never performs the transfer itself.
fn mark_cross_backend_transfers(graph: &mut Graph) -> usize {
    let mut edges = Vec::new();
    for node in graph.nodes() {
        if graph.is_sentinel(node.index()) {
            continue;
        }
        let Some(consumer_backend) = node.assigned_backend() else {
            continue;
        };
        for input in node.inputs() {
            let Some(producer) = graph.producer_of(*input) else {
                continue;
            };
            let Some(producer_backend) = graph
                .node(producer)
                .and_then(|producer_node| producer_node.assigned_backend())
            else {
                continue;
            };
            if producer_backend != consumer_backend {
                edges.push(TransferEdge {
                    producer,
                    consumer: node.index(),
                    arg: *input,
                });
            }
        }
    }
    let count = edges.len();
    for edge in edges {
        graph.mark_transfer(edge);
    }
    count
}
