//! Vectorized backend with partial coverage: f32 operands, fully static
//! shapes, and a small fusable op set.
//!
//! The provider claims producer→consumer pairs from its fusion table as
//! single fused groups when the producer's output has exactly one consumer;
//! everything else it supports is claimed node by node. Nodes outside its
//! coverage are left for later backends in the preference order.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use tessera::graph::{DType, Graph, Node, NodeIndex};
use tessera::kernel::{
    KernelContext, KernelDefBuilder, KernelLookup, KernelRegistry, OpKernel, RegistrationError,
};
use tessera::provider::{BackendId, CapabilityClaim, ExecutionProvider, PartitionView};

pub fn backend_id() -> BackendId {
    BackendId::new("simd")
}

/// Producer→consumer op pairs this backend executes as one fused unit.
const FUSABLE: &[(&str, &str)] = &[("Conv", "Relu"), ("MatMul", "Relu"), ("MatMul", "Add")];

const SUPPORTED_OPS: &[&str] = &["Add", "Mul", "Relu", "Softmax", "MatMul", "Conv"];

struct SimdKernel {
    label: String,
}

impl OpKernel for SimdKernel {
    fn name(&self) -> &str {
        &self.label
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
        trace!(kernel = self.label.as_str(), node = %ctx.node().index(), "simd kernel invoked");
        Ok(())
    }
}

/// Builds the vectorized kernel catalog: the supported op set, f32 only.
pub fn simd_kernel_registry() -> Result<KernelRegistry, RegistrationError> {
    let simd = backend_id();
    let mut registry = KernelRegistry::new(simd.clone());
    for op in SUPPORTED_OPS {
        let label = format!("simd::{}", op.to_lowercase());
        registry.register(
            KernelDefBuilder::new(*op, simd.clone())
                .since_version(1)
                .type_constraint("T", [DType::F32])
                .build(),
            Arc::new(move |_node: &Node| {
                Ok(Box::new(SimdKernel {
                    label: label.clone(),
                }) as Box<dyn OpKernel>)
            }),
        )?;
    }
    Ok(registry)
}

pub struct SimdExecutionProvider {
    id: BackendId,
}

impl SimdExecutionProvider {
    pub fn new() -> Self {
        Self { id: backend_id() }
    }

    /// Coverage gate: a registered kernel plus fully static shapes on every
    /// operand. Vector codegen cannot size its loops against symbolic dims.
    fn supports(&self, graph: &Graph, node: &Node, kernels: &dyn KernelLookup) -> bool {
        if !kernels.has_kernel(graph, node, &self.id) {
            return false;
        }
        node.inputs().iter().chain(node.outputs()).all(|arg| {
            graph
                .arg(*arg)
                .shape()
                .is_some_and(|shape| shape.static_dims().is_some())
        })
    }

    /// Looks for the unique consumer forming a fusable pair with `node`.
    fn fusable_consumer(
        &self,
        graph: &Graph,
        node: &Node,
        supported: &HashSet<NodeIndex>,
        claimed: &HashSet<NodeIndex>,
    ) -> Option<NodeIndex> {
        let output = node.outputs().first()?;
        let consumers = graph.consumers_of(*output);
        let [consumer] = consumers.as_slice() else {
            return None;
        };
        if claimed.contains(consumer) || !supported.contains(consumer) {
            return None;
        }
        let consumer_node = graph.node(*consumer)?;
        FUSABLE
            .iter()
            .any(|(producer_op, consumer_op)| {
                node.op_type() == *producer_op && consumer_node.op_type() == *consumer_op
            })
            .then_some(*consumer)
    }
}

impl Default for SimdExecutionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionProvider for SimdExecutionProvider {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn get_capability(
        &self,
        view: &PartitionView<'_>,
        kernels: &dyn KernelLookup,
    ) -> Vec<CapabilityClaim> {
        let graph = view.graph();
        let supported: HashSet<NodeIndex> = view
            .nodes()
            .filter(|node| self.supports(graph, node, kernels))
            .map(|node| node.index())
            .collect();

        let mut claimed: HashSet<NodeIndex> = HashSet::new();
        let mut claims = Vec::new();
        for node in view.nodes() {
            let index = node.index();
            if !supported.contains(&index) || claimed.contains(&index) {
                continue;
            }
            if let Some(consumer) = self.fusable_consumer(graph, node, &supported, &claimed) {
                let consumer_op = graph
                    .node(consumer)
                    .map(|n| n.op_type().to_lowercase())
                    .unwrap_or_default();
                claimed.insert(index);
                claimed.insert(consumer);
                claims.push(CapabilityClaim::fused(
                    vec![index, consumer],
                    format!("{}_{}", node.op_type().to_lowercase(), consumer_op),
                ));
                continue;
            }
            claimed.insert(index);
            claims.push(CapabilityClaim::single(index));
        }
        claims
    }
}
