//! Generic CPU backend: the mandatory fallback with universal kernel
//! coverage over the workspace operator set.
//!
//! Registration happens in an explicit phase at startup:
//! [`cpu_kernel_registry`] builds the immutable catalog which the session
//! installs into its [`KernelRegistryManager`]. Kernel bodies are opaque
//! executable units; their numeric implementations live outside the
//! partitioning core.

use std::sync::Arc;

use anyhow::bail;
use tracing::trace;

use tessera::graph::{DType, Node};
use tessera::kernel::{
    KernelContext, KernelDefBuilder, KernelLookup, KernelRegistry, OpKernel, RegistrationError,
};
use tessera::provider::{BackendId, CapabilityClaim, ExecutionProvider, PartitionView};

pub fn backend_id() -> BackendId {
    BackendId::new("cpu")
}

const NUMERIC: &[DType] = &[
    DType::F16,
    DType::F32,
    DType::F64,
    DType::I32,
    DType::I64,
    DType::U8,
];

const FLOATING: &[DType] = &[DType::F16, DType::F32, DType::F64];

/// Elementwise and shape ops share one attribute-free kernel body.
struct GenericCpuKernel {
    label: String,
}

impl OpKernel for GenericCpuKernel {
    fn name(&self) -> &str {
        &self.label
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
        trace!(kernel = self.label.as_str(), node = %ctx.node().index(), "cpu kernel invoked");
        Ok(())
    }
}

/// Pad validates its attribute layout at construction: paddings come in
/// (before, after) pairs per axis.
struct PadCpuKernel {
    label: String,
    pads: Vec<i64>,
}

impl PadCpuKernel {
    fn from_node(node: &Node) -> anyhow::Result<Self> {
        let pads = node
            .attribute("pads")
            .and_then(|attr| attr.as_i64_array())
            .map(<[i64]>::to_vec)
            .unwrap_or_default();
        if pads.len() % 2 != 0 {
            bail!(
                "pads attribute of node {} must hold (before, after) pairs, got {} entries",
                node.index(),
                pads.len()
            );
        }
        Ok(Self {
            label: "cpu::pad".to_string(),
            pads,
        })
    }
}

impl OpKernel for PadCpuKernel {
    fn name(&self) -> &str {
        &self.label
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
        trace!(
            node = %ctx.node().index(),
            pad_pairs = self.pads.len() / 2,
            "cpu pad kernel invoked"
        );
        Ok(())
    }
}

fn generic_factory(
    label: &str,
) -> Arc<dyn Fn(&Node) -> anyhow::Result<Box<dyn OpKernel>> + Send + Sync> {
    let label = format!("cpu::{label}");
    Arc::new(move |_node: &Node| {
        Ok(Box::new(GenericCpuKernel {
            label: label.clone(),
        }) as Box<dyn OpKernel>)
    })
}

/// Builds the CPU kernel catalog. Call once during the registration phase.
pub fn cpu_kernel_registry() -> Result<KernelRegistry, RegistrationError> {
    let cpu = backend_id();
    let mut registry = KernelRegistry::new(cpu.clone());

    for op in ["Add", "Mul", "Relu", "Softmax", "MatMul", "Conv"] {
        registry.register(
            KernelDefBuilder::new(op, cpu.clone())
                .since_version(1)
                .type_constraint("T", FLOATING.iter().copied())
                .build(),
            generic_factory(&op.to_lowercase()),
        )?;
    }

    for op in ["Reshape", "Transpose", "Unsqueeze", "Squeeze", "Concat"] {
        registry.register(
            KernelDefBuilder::new(op, cpu.clone())
                .since_version(1)
                .type_constraint("T", NUMERIC.iter().copied())
                .build(),
            generic_factory(&op.to_lowercase()),
        )?;
    }

    // Pad changed attribute layout at opset 11; the two signatures cover
    // disjoint version ranges and resolve deterministically.
    let pad_factory: Arc<dyn Fn(&Node) -> anyhow::Result<Box<dyn OpKernel>> + Send + Sync> =
        Arc::new(|node: &Node| Ok(Box::new(PadCpuKernel::from_node(node)?) as Box<dyn OpKernel>));
    registry.register(
        KernelDefBuilder::new("Pad", cpu.clone())
            .version_range(2, 10)
            .type_constraint("T", NUMERIC.iter().copied())
            .build(),
        Arc::clone(&pad_factory),
    )?;
    registry.register(
        KernelDefBuilder::new("Pad", cpu.clone())
            .since_version(11)
            .type_constraint("T", NUMERIC.iter().copied())
            .build(),
        pad_factory,
    )?;

    Ok(registry)
}

/// Fallback provider: claims every offered node the CPU catalog covers, one
/// node per claim.
pub struct CpuExecutionProvider {
    id: BackendId,
}

impl CpuExecutionProvider {
    pub fn new() -> Self {
        Self { id: backend_id() }
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn get_capability(
        &self,
        view: &PartitionView<'_>,
        kernels: &dyn KernelLookup,
    ) -> Vec<CapabilityClaim> {
        view.nodes()
            .filter(|node| kernels.has_kernel(view.graph(), node, &self.id))
            .map(|node| CapabilityClaim::single(node.index()))
            .collect()
    }
}
