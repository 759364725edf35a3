//! Kernel signatures and the opaque executable units they construct.
//!
//! A kernel signature keys on operator type, domain, an inclusive opset
//! version range, the target backend, and a type-constraint map from formal
//! type-parameter names to the concrete element types the kernel accepts.
//! Registries must be conflict-free by construction: two signatures that
//! could structurally match the same node are rejected when the second one is
//! registered, never tie-broken at lookup time.

pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::graph::{DType, Graph, Node, DEFAULT_DOMAIN};
use crate::provider::BackendId;

pub use registry::{KernelLookup, KernelRegistry, KernelRegistryManager};

/// A constructible, executable implementation of one operator for one backend
/// and type combination. The partitioning core treats kernels as opaque: it
/// only needs to know one exists and be able to invoke it.
pub trait OpKernel: Send + Sync {
    /// Stable name used in diagnostics and profiling events.
    fn name(&self) -> &str;

    /// Executes the kernel against the node it was constructed for.
    fn compute(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()>;
}

impl fmt::Debug for dyn OpKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpKernel").field("name", &self.name()).finish()
    }
}

/// Per-invocation context handed to [`OpKernel::compute`].
pub struct KernelContext<'a> {
    node: &'a Node,
}

impl<'a> KernelContext<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Node {
        self.node
    }
}

/// Factory constructing a kernel instance for a concrete node.
pub type KernelFactory = Arc<dyn Fn(&Node) -> anyhow::Result<Box<dyn OpKernel>> + Send + Sync>;

/// Allowed concrete types for one formal type parameter.
pub type TypeConstraint = SmallVec<[DType; 4]>;

/// A kernel registration signature.
#[derive(Debug, Clone)]
pub struct KernelDef {
    op_type: String,
    domain: String,
    backend: BackendId,
    since_version: u32,
    until_version: Option<u32>,
    type_constraints: BTreeMap<String, TypeConstraint>,
}

impl KernelDef {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    /// Inclusive opset version range covered by this signature.
    pub fn version_range(&self) -> (u32, Option<u32>) {
        (self.since_version, self.until_version)
    }

    pub fn type_constraints(&self) -> &BTreeMap<String, TypeConstraint> {
        &self.type_constraints
    }

    pub fn matches_version(&self, version: u32) -> bool {
        version >= self.since_version && self.until_version.map_or(true, |until| version <= until)
    }

    /// Whether every type constraint is satisfied by the concrete bindings
    /// derived from a node. A constraint naming a parameter the node does not
    /// bind is unsatisfiable.
    pub fn matches_types(&self, bindings: &BTreeMap<String, DType>) -> bool {
        self.type_constraints.iter().all(|(name, allowed)| {
            bindings
                .get(name)
                .map_or(false, |concrete| allowed.contains(concrete))
        })
    }

    fn versions_overlap(&self, other: &KernelDef) -> bool {
        let starts_before_other_ends = other
            .until_version
            .map_or(true, |until| self.since_version <= until);
        let other_starts_before_self_ends = self
            .until_version
            .map_or(true, |until| other.since_version <= until);
        starts_before_other_ends && other_starts_before_self_ends
    }

    /// Two signatures conflict when one node could structurally match both:
    /// same operator and domain, overlapping version ranges, and no shared
    /// type parameter whose allowed sets are disjoint.
    pub fn conflicts_with(&self, other: &KernelDef) -> bool {
        if self.op_type != other.op_type || self.domain != other.domain {
            return false;
        }
        if !self.versions_overlap(other) {
            return false;
        }
        for (name, allowed) in &self.type_constraints {
            if let Some(other_allowed) = other.type_constraints.get(name) {
                let disjoint = allowed.iter().all(|dtype| !other_allowed.contains(dtype));
                if disjoint {
                    return false;
                }
            }
        }
        true
    }

    fn version_range_display(&self) -> String {
        match self.until_version {
            Some(until) => format!("{}..={}", self.since_version, until),
            None => format!("{}..", self.since_version),
        }
    }
}

impl fmt::Display for KernelDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) versions {} on {}",
            self.op_type,
            if self.domain.is_empty() {
                "core"
            } else {
                self.domain.as_str()
            },
            self.version_range_display(),
            self.backend
        )
    }
}

/// Fluent builder for [`KernelDef`] signatures, used during the explicit
/// registration phase at startup.
pub struct KernelDefBuilder {
    op_type: String,
    domain: String,
    backend: BackendId,
    since_version: u32,
    until_version: Option<u32>,
    type_constraints: BTreeMap<String, TypeConstraint>,
}

impl KernelDefBuilder {
    pub fn new(op_type: impl Into<String>, backend: BackendId) -> Self {
        Self {
            op_type: op_type.into(),
            domain: DEFAULT_DOMAIN.to_string(),
            backend,
            since_version: 1,
            until_version: None,
            type_constraints: BTreeMap::new(),
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Open-ended coverage starting at `version`.
    pub fn since_version(mut self, version: u32) -> Self {
        self.since_version = version;
        self.until_version = None;
        self
    }

    /// Inclusive version range coverage.
    pub fn version_range(mut self, since: u32, until: u32) -> Self {
        self.since_version = since;
        self.until_version = Some(until);
        self
    }

    pub fn type_constraint(
        mut self,
        name: impl Into<String>,
        allowed: impl IntoIterator<Item = DType>,
    ) -> Self {
        self.type_constraints
            .insert(name.into(), allowed.into_iter().collect());
        self
    }

    pub fn build(self) -> KernelDef {
        KernelDef {
            op_type: self.op_type,
            domain: self.domain,
            backend: self.backend,
            since_version: self.since_version,
            until_version: self.until_version,
            type_constraints: self.type_constraints,
        }
    }
}

/// Registration-phase failure. Fatal at startup; never surfaces during
/// partitioning.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("kernel {def} conflicts with the existing registration {existing}")]
    DuplicateRegistration { def: String, existing: String },
    #[error("kernel {def} targets backend {def_backend} but the registry holds {registry_backend}")]
    WrongBackend {
        def: String,
        def_backend: BackendId,
        registry_backend: BackendId,
    },
    #[error("backend {0} already has a registered kernel registry")]
    DuplicateRegistry(BackendId),
}

/// Kernel-resolution failure for one (node, backend) pair. Recoverable for
/// the partitioner, which simply moves on to the next backend.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(
        "no kernel for {op_type}({domain}) opset {version} on backend {backend} \
         with operand types {types:?}"
    )]
    NotFound {
        op_type: String,
        domain: String,
        version: u32,
        backend: BackendId,
        types: Vec<DType>,
    },
    #[error("kernel factory for {op_type} on backend {backend} failed")]
    Construction {
        op_type: String,
        backend: BackendId,
        #[source]
        source: anyhow::Error,
    },
}

/// Derives the concrete type bindings kernel lookup matches constraints
/// against. By convention `"T"` binds to the first input's element type,
/// `"T1"`/`"T2"` to the second and third; a node without inputs binds `"T"`
/// to its first output.
pub fn type_bindings(graph: &Graph, node: &Node) -> BTreeMap<String, DType> {
    let mut bindings = BTreeMap::new();
    for (position, arg) in node.inputs().iter().enumerate() {
        let Some(dtype) = graph.arg(*arg).dtype() else {
            continue;
        };
        let name = if position == 0 {
            "T".to_string()
        } else {
            format!("T{position}")
        };
        bindings.insert(name, dtype);
    }
    if node.inputs().is_empty() {
        if let Some(first_output) = node.outputs().first() {
            if let Some(dtype) = graph.arg(*first_output).dtype() {
                bindings.insert("T".to_string(), dtype);
            }
        }
    }
    bindings
}
