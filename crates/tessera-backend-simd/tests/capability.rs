use std::sync::Arc;

use tessera::graph::{
    ArgId, DType, Dimension, DimSymbol, Graph, NodeIndex, Shape, TensorLiteral, TensorSpec,
    DEFAULT_DOMAIN,
};
use tessera::kernel::KernelRegistryManager;
use tessera::provider::{ExecutionProvider, PartitionView};
use tessera_backend_simd::{simd_kernel_registry, SimdExecutionProvider};

fn manager() -> KernelRegistryManager {
    let mut manager = KernelRegistryManager::new();
    manager
        .add_registry(Arc::new(simd_kernel_registry().expect("simd registry builds")))
        .expect("install simd registry");
    manager
}

fn f32_arg(graph: &mut Graph, name: &str, dims: &[usize]) -> ArgId {
    graph.add_arg(
        name,
        Some(DType::F32),
        Some(Shape::from_static(dims.iter().copied())),
    )
}

fn offered_nodes(graph: &Graph) -> Vec<NodeIndex> {
    graph
        .nodes()
        .filter(|node| !graph.is_sentinel(node.index()))
        .map(|node| node.index())
        .collect()
}

#[test]
fn conv_relu_chain_is_claimed_as_one_fused_group() {
    let manager = manager();
    let mut graph = Graph::new();
    let x = f32_arg(&mut graph, "x", &[1, 8, 16, 16]);
    let w = f32_arg(&mut graph, "w", &[8, 8, 3, 3]);
    let conv_out = f32_arg(&mut graph, "conv_out", &[1, 8, 16, 16]);
    let relu_out = f32_arg(&mut graph, "relu_out", &[1, 8, 16, 16]);
    let conv = graph.add_node("conv0", "Conv", DEFAULT_DOMAIN, 11, &[x, w], &[conv_out]);
    let relu = graph.add_node("relu0", "Relu", DEFAULT_DOMAIN, 14, &[conv_out], &[relu_out]);
    graph.set_graph_inputs(vec![x]);
    graph.set_graph_outputs(vec![relu_out]);
    graph
        .add_initializer(
            "w",
            TensorLiteral::zeroed(TensorSpec::new(DType::F32, Shape::from_static([8, 8, 3, 3]))),
        )
        .expect("weight initializer");
    graph.resolve().expect("graph resolves");

    let provider = SimdExecutionProvider::new();
    let view = PartitionView::new(&graph, offered_nodes(&graph));
    let claims = provider.get_capability(&view, &manager);

    assert_eq!(claims.len(), 1);
    assert!(claims[0].is_fused());
    assert_eq!(claims[0].nodes, vec![conv, relu]);
}

#[test]
fn multi_consumer_outputs_are_not_fused() {
    let manager = manager();
    let mut graph = Graph::new();
    let x = f32_arg(&mut graph, "x", &[4, 4]);
    let y = f32_arg(&mut graph, "y", &[4, 4]);
    let mm_out = f32_arg(&mut graph, "mm_out", &[4, 4]);
    let relu_out = f32_arg(&mut graph, "relu_out", &[4, 4]);
    let add_out = f32_arg(&mut graph, "add_out", &[4, 4]);

    // MatMul feeds both Relu and Add; fusing it into either would hide a
    // value the other still needs.
    graph.add_node("mm0", "MatMul", DEFAULT_DOMAIN, 13, &[x, y], &[mm_out]);
    graph.add_node("relu0", "Relu", DEFAULT_DOMAIN, 14, &[mm_out], &[relu_out]);
    graph.add_node("add0", "Add", DEFAULT_DOMAIN, 14, &[mm_out, y], &[add_out]);
    graph.set_graph_inputs(vec![x, y]);
    graph.resolve().expect("graph resolves");

    let provider = SimdExecutionProvider::new();
    let view = PartitionView::new(&graph, offered_nodes(&graph));
    let claims = provider.get_capability(&view, &manager);

    assert_eq!(claims.len(), 3);
    assert!(claims.iter().all(|claim| !claim.is_fused()));
}

#[test]
fn dynamic_shapes_are_outside_coverage() {
    let manager = manager();
    let mut graph = Graph::new();
    let x = graph.add_arg(
        "x",
        Some(DType::F32),
        Some(Shape::new(vec![
            Dimension::Dynamic(DimSymbol::new("batch")),
            Dimension::Static(8),
        ])),
    );
    let y = graph.add_arg(
        "y",
        Some(DType::F32),
        Some(Shape::new(vec![
            Dimension::Dynamic(DimSymbol::new("batch")),
            Dimension::Static(8),
        ])),
    );
    graph.add_node("relu0", "Relu", DEFAULT_DOMAIN, 14, &[x], &[y]);
    graph.set_graph_inputs(vec![x]);
    graph.resolve().expect("graph resolves");

    let provider = SimdExecutionProvider::new();
    let view = PartitionView::new(&graph, offered_nodes(&graph));
    assert!(provider.get_capability(&view, &manager).is_empty());
}

#[test]
fn non_f32_operands_are_outside_coverage() {
    let manager = manager();
    let mut graph = Graph::new();
    let x = graph.add_arg("x", Some(DType::F64), Some(Shape::from_static([4])));
    let y = graph.add_arg("y", Some(DType::F64), Some(Shape::from_static([4])));
    graph.add_node("relu0", "Relu", DEFAULT_DOMAIN, 14, &[x], &[y]);
    graph.set_graph_inputs(vec![x]);
    graph.resolve().expect("graph resolves");

    let provider = SimdExecutionProvider::new();
    let view = PartitionView::new(&graph, offered_nodes(&graph));
    assert!(provider.get_capability(&view, &manager).is_empty());
}
