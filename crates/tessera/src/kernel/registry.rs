//! Per-backend kernel catalogs and the manager aggregating them.
//!
//! Registries are populated during an explicit registration phase and treated
//! as immutable afterwards; lookups take `&self` and are safe to run
//! concurrently from independent partitioning passes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::graph::{DType, Graph, Node};
use crate::provider::BackendId;

use super::{
    type_bindings, KernelDef, KernelError, KernelFactory, OpKernel, RegistrationError,
};

/// One registered signature plus the factory that constructs its kernel.
pub struct KernelEntry {
    def: KernelDef,
    factory: KernelFactory,
}

impl KernelEntry {
    pub fn def(&self) -> &KernelDef {
        &self.def
    }

    pub fn instantiate(&self, node: &Node) -> anyhow::Result<Box<dyn OpKernel>> {
        (self.factory)(node)
    }
}

/// Catalog of constructible kernels for one backend kind.
pub struct KernelRegistry {
    backend: BackendId,
    entries: HashMap<(String, String), Vec<KernelEntry>>,
}

impl KernelRegistry {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            entries: HashMap::new(),
        }
    }

    pub fn backend(&self) -> &BackendId {
        &self.backend
    }

    /// Adds a signature → factory mapping. Rejects signatures that could
    /// structurally match the same node as an existing registration, so the
    /// registry stays conflict-free by construction and lookup never needs a
    /// tie-break.
    pub fn register(
        &mut self,
        def: KernelDef,
        factory: KernelFactory,
    ) -> Result<(), RegistrationError> {
        if def.backend() != &self.backend {
            return Err(RegistrationError::WrongBackend {
                def: def.to_string(),
                def_backend: def.backend().clone(),
                registry_backend: self.backend.clone(),
            });
        }
        let key = (def.op_type().to_string(), def.domain().to_string());
        let slot = self.entries.entry(key).or_default();
        if let Some(existing) = slot.iter().find(|entry| entry.def.conflicts_with(&def)) {
            return Err(RegistrationError::DuplicateRegistration {
                def: def.to_string(),
                existing: existing.def.to_string(),
            });
        }
        trace!(%def, "registered kernel");
        slot.push(KernelEntry { def, factory });
        Ok(())
    }

    /// Deterministic single-result lookup. With conflict-free registration at
    /// most one signature can match a given (version, bindings) pair.
    pub fn find(
        &self,
        op_type: &str,
        domain: &str,
        version: u32,
        bindings: &BTreeMap<String, DType>,
    ) -> Option<&KernelEntry> {
        let key = (op_type.to_string(), domain.to_string());
        self.entries.get(&key)?.iter().find(|entry| {
            entry.def.matches_version(version) && entry.def.matches_types(bindings)
        })
    }

    /// Number of registered signatures, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Answers "does backend B have a kernel for node N" without exposing
/// registry internals. The seam the partitioner and providers depend on.
pub trait KernelLookup {
    fn has_kernel(&self, graph: &Graph, node: &Node, backend: &BackendId) -> bool;
}

/// Owns one kernel registry per backend kind plus user-supplied custom-op
/// registries consulted before backend-native ones. Resolution is pure and
/// deterministic; there are no retry semantics — callers retry only with a
/// different backend.
#[derive(Default)]
pub struct KernelRegistryManager {
    custom: Vec<Arc<KernelRegistry>>,
    backends: HashMap<BackendId, Arc<KernelRegistry>>,
}

impl KernelRegistryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the native registry for its backend kind. One registry per
    /// backend.
    pub fn add_registry(&mut self, registry: Arc<KernelRegistry>) -> Result<(), RegistrationError> {
        let backend = registry.backend().clone();
        if self.backends.contains_key(&backend) {
            return Err(RegistrationError::DuplicateRegistry(backend));
        }
        debug!(%backend, kernels = registry.len(), "installed backend kernel registry");
        self.backends.insert(backend, registry);
        Ok(())
    }

    /// Installs a user-supplied custom-operator registry. Custom registries
    /// are searched before backend-native ones, in installation order.
    pub fn add_custom_registry(&mut self, registry: Arc<KernelRegistry>) {
        debug!(
            backend = %registry.backend(),
            kernels = registry.len(),
            "installed custom kernel registry"
        );
        self.custom.push(registry);
    }

    pub fn registry_for(&self, backend: &BackendId) -> Option<&Arc<KernelRegistry>> {
        self.backends.get(backend)
    }

    fn locate(&self, graph: &Graph, node: &Node, backend: &BackendId) -> Option<&KernelEntry> {
        let bindings = type_bindings(graph, node);
        for registry in self.custom.iter().filter(|r| r.backend() == backend) {
            if let Some(entry) =
                registry.find(node.op_type(), node.domain(), node.version(), &bindings)
            {
                return Some(entry);
            }
        }
        self.backends.get(backend).and_then(|registry| {
            registry.find(node.op_type(), node.domain(), node.version(), &bindings)
        })
    }

    /// Constructs the kernel instance for a node on a backend, or reports the
    /// full signature that failed to resolve.
    pub fn create_kernel(
        &self,
        graph: &Graph,
        node: &Node,
        backend: &BackendId,
    ) -> Result<Box<dyn OpKernel>, KernelError> {
        let Some(entry) = self.locate(graph, node, backend) else {
            let types = node
                .inputs()
                .iter()
                .filter_map(|arg| graph.arg(*arg).dtype())
                .collect();
            return Err(KernelError::NotFound {
                op_type: node.op_type().to_string(),
                domain: node.domain().to_string(),
                version: node.version(),
                backend: backend.clone(),
                types,
            });
        };
        entry
            .instantiate(node)
            .map_err(|source| KernelError::Construction {
                op_type: node.op_type().to_string(),
                backend: backend.clone(),
                source,
            })
    }
}

impl KernelLookup for KernelRegistryManager {
    /// Backend-agnostic: a backend with no installed registry never matches.
    fn has_kernel(&self, graph: &Graph, node: &Node, backend: &BackendId) -> bool {
        self.locate(graph, node, backend).is_some()
    }
}
