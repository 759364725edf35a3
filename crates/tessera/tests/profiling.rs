use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tessera::profiling::{EventCategory, Profiler};

#[test]
fn scopes_record_named_timed_events() {
    let profiler = Profiler::new();
    profiler.start();
    {
        let _scope = profiler
            .scope(EventCategory::Partition, "partition")
            .arg("graph", "main");
    }
    profiler.stop();

    let events = profiler.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].name, "partition");
    assert_eq!(events[0].args.get("graph").map(String::as_str), Some("main"));
}

#[test]
fn disabled_profiler_records_nothing() {
    let profiler = Profiler::new();
    let _scope = profiler.scope(EventCategory::Session, "ignored");
    drop(_scope);
    profiler.record_event(
        EventCategory::Node,
        "also_ignored",
        Instant::now(),
        BTreeMap::new(),
    );
    assert!(profiler.events().is_empty());
}

#[test]
fn event_buffer_is_bounded() {
    let profiler = Profiler::with_capacity(2);
    profiler.start();
    for i in 0..5 {
        profiler.record_event(
            EventCategory::Node,
            format!("event{i}"),
            Instant::now(),
            BTreeMap::new(),
        );
    }
    assert_eq!(profiler.events().len(), 2);
}

#[test]
fn chrome_trace_export_is_well_formed() {
    let profiler = Profiler::new();
    profiler.start();
    {
        let _scope = profiler
            .scope(EventCategory::Provider, "get_capability::cpu")
            .arg("claims", "3");
    }
    profiler.stop();

    let trace = profiler.export_chrome_trace().expect("export succeeds");
    let parsed: serde_json::Value = serde_json::from_str(&trace).expect("valid JSON");
    let events = parsed.as_array().expect("top-level array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["ph"], "X");
    assert_eq!(events[0]["cat"], "provider");
    assert_eq!(events[0]["name"], "get_capability::cpu");
    assert_eq!(events[0]["args"]["claims"], "3");
}

#[test]
fn partitioner_records_capability_query_events() {
    use tessera::kernel::KernelRegistryManager;
    use tessera::partition::GraphPartitioner;
    use tessera::provider::ExecutionProvider;
    use tessera_backend_cpu::{cpu_kernel_registry, CpuExecutionProvider};

    let mut manager = KernelRegistryManager::new();
    manager
        .add_registry(Arc::new(cpu_kernel_registry().expect("cpu registry")))
        .expect("install cpu registry");
    let providers: Vec<Arc<dyn ExecutionProvider>> = vec![Arc::new(CpuExecutionProvider::new())];

    let profiler = Arc::new(Profiler::new());
    profiler.start();
    let partitioner =
        GraphPartitioner::new(&manager, &providers, tessera_backend_cpu::backend_id())
            .with_profiler(Arc::clone(&profiler));

    let mut graph = tessera::Graph::new();
    let x = graph.add_arg(
        "x",
        Some(tessera::graph::DType::F32),
        Some(tessera::graph::Shape::from_static([4])),
    );
    let y = graph.add_arg(
        "y",
        Some(tessera::graph::DType::F32),
        Some(tessera::graph::Shape::from_static([4])),
    );
    graph.add_node("relu0", "Relu", tessera::graph::DEFAULT_DOMAIN, 14, &[x], &[y]);
    graph.set_graph_inputs(vec![x]);
    partitioner.partition(&mut graph).expect("partition succeeds");
    profiler.stop();

    let events = profiler.events();
    assert!(events.iter().any(|event| event.name == "partition"));
    assert!(events
        .iter()
        .any(|event| event.name == "get_capability::cpu"));
}
