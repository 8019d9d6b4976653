use pdcore::config::EngineConfig;
use pdcore::graph::Graph;
use pdcore::node::NodeKind;
use pdcore::plan::Plan;
use pdcore::rt::{render_offline, Runtime};
use std::sync::Arc;

fn noisy_graph() -> Graph {
    let mut graph = Graph::new();
    let noise = graph.add_node(NodeKind::Noise { seed: 42 });
    let lop = graph.add_node(NodeKind::Lowpass { cutoff: 800.0 });
    let osc = graph.add_node(NodeKind::Osc { freq: 220.0 });
    let mix = graph.add_node(NodeKind::Mixer { inputs: 2 });
    let dac = graph.add_node(NodeKind::Dac { channel: 0 });
    graph.connect(noise, 0, lop, 0).unwrap();
    graph.connect(lop, 0, mix, 0).unwrap();
    graph.connect(osc, 0, mix, 1).unwrap();
    graph.connect(mix, 0, dac, 0).unwrap();
    graph
}

#[test]
fn plan_deterministic_compilation() {
    let graph = noisy_graph();
    let config = EngineConfig::default();
    let plan1 = Plan::compile(&graph, &config).unwrap();
    let plan2 = Plan::compile(&graph, &config).unwrap();
    assert_eq!(plan1.order, plan2.order);
    assert_eq!(plan1.edges, plan2.edges);
    assert_eq!(plan1, plan2);
}

#[test]
fn same_plan_renders_identical_samples() {
    let plan = Arc::new(Plan::compile(&noisy_graph(), &EngineConfig::default()).unwrap());
    let mut a = Runtime::new(Arc::clone(&plan));
    let mut b = Runtime::new(plan);
    let out_a = render_offline(&mut a, 4096);
    let out_b = render_offline(&mut b, 4096);
    assert_eq!(out_a, out_b);
    assert!(out_a.iter().any(|&s| s != 0.0));
}

#[test]
fn plan_rejects_invalid_graph() {
    let mut graph = Graph::new();
    graph.add_node(NodeKind::Dac { channel: 0 });
    assert!(Plan::compile(&graph, &EngineConfig::default()).is_err());
}
