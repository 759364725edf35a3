use std::collections::BTreeMap;

use tessera::graph::{
    AttributeValue, DType, Graph, Shape, TensorLiteral, TensorSpec, DEFAULT_DOMAIN,
};
use tessera::passes::{apply_transforms, GraphTransform, UnsqueezeElimination};

/// `Unsqueeze(w) → Add(x, ·)` where `w` is an initializer: the pass should
/// fold the unit axis into `w` and drop the node.
fn unsqueeze_graph() -> Graph {
    let mut graph = Graph::new();
    let w = graph.add_arg("w", Some(DType::F32), Some(Shape::from_static([3, 4])));
    let unsqueezed = graph.add_arg(
        "w_unsqueezed",
        Some(DType::F32),
        Some(Shape::from_static([1, 3, 4])),
    );
    let x = graph.add_arg("x", Some(DType::F32), Some(Shape::from_static([1, 3, 4])));
    let y = graph.add_arg("y", Some(DType::F32), Some(Shape::from_static([1, 3, 4])));

    let mut attrs = BTreeMap::new();
    attrs.insert("axes".to_string(), AttributeValue::I64Array(vec![0]));
    graph.add_node_with_attributes(
        "unsqueeze0",
        "Unsqueeze",
        DEFAULT_DOMAIN,
        11,
        &[w],
        &[unsqueezed],
        attrs,
    );
    graph.add_node("add0", "Add", DEFAULT_DOMAIN, 14, &[x, unsqueezed], &[y]);

    graph.set_graph_inputs(vec![x]);
    graph.set_graph_outputs(vec![y]);
    graph
        .add_initializer(
            "w",
            TensorLiteral::zeroed(TensorSpec::new(DType::F32, Shape::from_static([3, 4]))),
        )
        .expect("weight initializer");
    graph.resolve().expect("graph resolves");
    graph
}

#[test]
fn unsqueeze_of_initializer_folds_into_its_shape() {
    let mut graph = unsqueeze_graph();
    assert_eq!(graph.op_node_count(), 2);

    let modified = UnsqueezeElimination
        .apply(&mut graph)
        .expect("pass applies cleanly");
    assert!(modified);

    // The node is gone and the constant carries the unsqueezed shape.
    assert_eq!(graph.op_node_count(), 1);
    let w = graph.initializer("w").expect("initializer survives");
    assert_eq!(w.spec.shape.static_dims(), Some(vec![1, 3, 4]));
    let w_arg = graph.arg_id("w").unwrap();
    assert_eq!(
        graph.arg(w_arg).shape().and_then(Shape::static_dims),
        Some(vec![1, 3, 4])
    );

    // The consumer reads the constant directly now.
    let add = graph
        .nodes()
        .find(|node| node.op_type() == "Add")
        .expect("consumer survives");
    assert!(add.inputs().contains(&w_arg));

    graph.resolve().expect("graph still resolves");
}

#[test]
fn unsqueeze_pass_is_idempotent() {
    let mut graph = unsqueeze_graph();
    assert!(UnsqueezeElimination.apply(&mut graph).expect("first run"));
    assert!(!UnsqueezeElimination.apply(&mut graph).expect("second run"));
}

#[test]
fn unsqueeze_fed_by_a_producer_node_is_left_alone() {
    let mut graph = Graph::new();
    let x = graph.add_arg("x", Some(DType::F32), Some(Shape::from_static([3, 4])));
    let a = graph.add_arg("a", Some(DType::F32), Some(Shape::from_static([3, 4])));
    let b = graph.add_arg("b", Some(DType::F32), Some(Shape::from_static([1, 3, 4])));

    graph.add_node("relu0", "Relu", DEFAULT_DOMAIN, 14, &[x], &[a]);
    let mut attrs = BTreeMap::new();
    attrs.insert("axes".to_string(), AttributeValue::I64Array(vec![0]));
    graph.add_node_with_attributes(
        "unsqueeze0",
        "Unsqueeze",
        DEFAULT_DOMAIN,
        11,
        &[a],
        &[b],
        attrs,
    );
    graph.set_graph_inputs(vec![x]);
    graph.resolve().expect("graph resolves");

    let modified = UnsqueezeElimination
        .apply(&mut graph)
        .expect("pass applies cleanly");
    assert!(!modified);
    assert_eq!(graph.op_node_count(), 2);
}

#[test]
fn transform_runner_reports_aggregate_modification() {
    let mut graph = unsqueeze_graph();
    let transforms: Vec<Box<dyn GraphTransform>> = vec![Box::new(UnsqueezeElimination)];
    assert!(apply_transforms(&mut graph, &transforms).expect("transforms run"));
    assert!(!apply_transforms(&mut graph, &transforms).expect("transforms rerun"));
}
