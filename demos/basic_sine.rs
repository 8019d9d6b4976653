//! Build a sine graph by hand and render one block.

use pdcore::config::EngineConfig;
use pdcore::graph::Graph;
use pdcore::node::NodeKind;
use pdcore::plan::Plan;
use pdcore::rt::Runtime;
use std::sync::Arc;

fn main() {
    let config = EngineConfig {
        channels_out: 1,
        ..EngineConfig::default()
    };

    // osc~ 440 -> *~ 0.5 -> dac~ 0
    let mut graph = Graph::new();
    let osc = graph.add_node(NodeKind::Osc { freq: 440.0 });
    let amp = graph.add_node(NodeKind::Gain { gain: 0.5 });
    let out = graph.add_node(NodeKind::Dac { channel: 0 });
    graph.connect(osc, 0, amp, 0).unwrap();
    graph.connect(amp, 0, out, 0).unwrap();

    let plan = Plan::compile(&graph, &config).unwrap();
    println!("processing order: {:?}", plan.order);
    let mut runtime = Runtime::new(Arc::new(plan));

    let mut block = vec![0.0; config.output_len()];
    runtime.process_block(None, &mut block);

    for (i, sample) in block.iter().take(10).enumerate() {
        println!("Sample {}: {:.5}", i, sample);
    }
}
