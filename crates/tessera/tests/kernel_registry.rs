use std::sync::Arc;

use tessera::graph::{ArgId, DType, Graph, Shape, DEFAULT_DOMAIN};
use tessera::kernel::{
    KernelContext, KernelDefBuilder, KernelError, KernelLookup, KernelRegistry,
    KernelRegistryManager, OpKernel, RegistrationError,
};
use tessera::provider::BackendId;

struct LabeledKernel(&'static str);

impl OpKernel for LabeledKernel {
    fn name(&self) -> &str {
        self.0
    }

    fn compute(&self, _ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn labeled_factory(
    label: &'static str,
) -> Arc<dyn Fn(&tessera::graph::Node) -> anyhow::Result<Box<dyn OpKernel>> + Send + Sync> {
    Arc::new(move |_node: &tessera::graph::Node| {
        Ok(Box::new(LabeledKernel(label)) as Box<dyn OpKernel>)
    })
}

fn typed_arg(graph: &mut Graph, name: &str, dtype: DType) -> ArgId {
    graph.add_arg(name, Some(dtype), Some(Shape::from_static([4])))
}

fn single_node_graph(op_type: &str, version: u32, dtype: DType) -> (Graph, tessera::graph::NodeIndex) {
    let mut graph = Graph::new();
    let x = typed_arg(&mut graph, "x", dtype);
    let y = typed_arg(&mut graph, "y", dtype);
    let node = graph.add_node("n0", op_type, DEFAULT_DOMAIN, version, &[x], &[y]);
    graph.set_graph_inputs(vec![x]);
    graph.resolve().expect("graph resolves");
    (graph, node)
}

#[test]
fn duplicate_registration_is_rejected_and_registry_unchanged() {
    let backend = BackendId::new("test");
    let mut registry = KernelRegistry::new(backend.clone());
    registry
        .register(
            KernelDefBuilder::new("Pad", backend.clone())
                .version_range(2, 10)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("first"),
        )
        .expect("first registration");

    // Overlapping version range with intersecting type constraints collides.
    let err = registry
        .register(
            KernelDefBuilder::new("Pad", backend.clone())
                .version_range(5, 12)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("second"),
        )
        .expect_err("overlapping registration must fail");
    assert!(matches!(
        err,
        RegistrationError::DuplicateRegistration { .. }
    ));

    assert_eq!(registry.len(), 1);
    let (graph, node) = single_node_graph("Pad", 7, DType::F32);
    let bindings = tessera::kernel::type_bindings(&graph, graph.node(node).unwrap());
    let entry = registry
        .find("Pad", DEFAULT_DOMAIN, 7, &bindings)
        .expect("original registration still resolves");
    assert_eq!(entry.def().version_range(), (2, Some(10)));
}

#[test]
fn disjoint_version_ranges_coexist_and_resolve_by_version() {
    let backend = BackendId::new("test");
    let mut registry = KernelRegistry::new(backend.clone());
    registry
        .register(
            KernelDefBuilder::new("Pad", backend.clone())
                .version_range(2, 10)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("pad_v2"),
        )
        .expect("versioned registration");
    registry
        .register(
            KernelDefBuilder::new("Pad", backend.clone())
                .since_version(11)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("pad_v11"),
        )
        .expect("disjoint range registers cleanly");

    let (graph, node) = single_node_graph("Pad", 9, DType::F32);
    let bindings = tessera::kernel::type_bindings(&graph, graph.node(node).unwrap());
    let entry = registry.find("Pad", DEFAULT_DOMAIN, 9, &bindings).unwrap();
    assert_eq!(entry.def().version_range(), (2, Some(10)));

    let entry = registry.find("Pad", DEFAULT_DOMAIN, 13, &bindings).unwrap();
    assert_eq!(entry.def().version_range(), (11, None));
}

#[test]
fn disjoint_type_constraints_coexist_and_resolve_by_operand_type() {
    let backend = BackendId::new("test");
    let mut registry = KernelRegistry::new(backend.clone());
    registry
        .register(
            KernelDefBuilder::new("Cast", backend.clone())
                .since_version(1)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("cast_f32"),
        )
        .expect("f32 registration");
    registry
        .register(
            KernelDefBuilder::new("Cast", backend.clone())
                .since_version(1)
                .type_constraint("T", [DType::I64])
                .build(),
            labeled_factory("cast_i64"),
        )
        .expect("i64 registration with disjoint types");

    let (graph, node) = single_node_graph("Cast", 1, DType::I64);
    let bindings = tessera::kernel::type_bindings(&graph, graph.node(node).unwrap());
    let entry = registry.find("Cast", DEFAULT_DOMAIN, 1, &bindings).unwrap();
    assert_eq!(
        entry.def().type_constraints()["T"].as_slice(),
        &[DType::I64][..]
    );
}

#[test]
fn lookup_misses_on_unsatisfied_type_constraint() {
    let backend = BackendId::new("test");
    let mut registry = KernelRegistry::new(backend.clone());
    registry
        .register(
            KernelDefBuilder::new("Relu", backend.clone())
                .since_version(1)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("relu"),
        )
        .expect("registration");

    let (graph, node) = single_node_graph("Relu", 1, DType::I64);
    let bindings = tessera::kernel::type_bindings(&graph, graph.node(node).unwrap());
    assert!(registry.find("Relu", DEFAULT_DOMAIN, 1, &bindings).is_none());
}

#[test]
fn manager_reports_no_kernel_for_unknown_backend() {
    let manager = KernelRegistryManager::new();
    let (graph, node) = single_node_graph("Relu", 1, DType::F32);
    let node = graph.node(node).unwrap();
    assert!(!manager.has_kernel(&graph, node, &BackendId::new("nonexistent")));
}

#[test]
fn create_kernel_error_carries_the_attempted_signature() {
    let manager = KernelRegistryManager::new();
    let (graph, node) = single_node_graph("Mystery", 4, DType::F32);
    let node = graph.node(node).unwrap();
    let err = manager
        .create_kernel(&graph, node, &BackendId::new("cpu"))
        .expect_err("no registry installed");
    match err {
        KernelError::NotFound {
            op_type,
            domain,
            version,
            backend,
            types,
        } => {
            assert_eq!(op_type, "Mystery");
            assert_eq!(domain, DEFAULT_DOMAIN);
            assert_eq!(version, 4);
            assert_eq!(backend.as_str(), "cpu");
            assert_eq!(types, vec![DType::F32]);
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn custom_registries_are_consulted_before_backend_native_ones() {
    let backend = BackendId::new("cpu");

    let mut native = KernelRegistry::new(backend.clone());
    native
        .register(
            KernelDefBuilder::new("Relu", backend.clone())
                .since_version(1)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("native::relu"),
        )
        .expect("native registration");

    let mut custom = KernelRegistry::new(backend.clone());
    custom
        .register(
            KernelDefBuilder::new("Relu", backend.clone())
                .since_version(1)
                .type_constraint("T", [DType::F32])
                .build(),
            labeled_factory("custom::relu"),
        )
        .expect("custom registration");

    let mut manager = KernelRegistryManager::new();
    manager
        .add_registry(Arc::new(native))
        .expect("install native registry");
    manager.add_custom_registry(Arc::new(custom));

    let (graph, node) = single_node_graph("Relu", 1, DType::F32);
    let node = graph.node(node).unwrap();
    let kernel = manager
        .create_kernel(&graph, node, &backend)
        .expect("kernel resolves");
    assert_eq!(kernel.name(), "custom::relu");
}

#[test]
fn one_registry_per_backend_kind() {
    let backend = BackendId::new("cpu");
    let mut manager = KernelRegistryManager::new();
    manager
        .add_registry(Arc::new(KernelRegistry::new(backend.clone())))
        .expect("first install");
    let err = manager
        .add_registry(Arc::new(KernelRegistry::new(backend)))
        .expect_err("second install must fail");
    assert!(matches!(err, RegistrationError::DuplicateRegistry(_)));
}
