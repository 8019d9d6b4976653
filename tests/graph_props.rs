use pdcore::config::EngineConfig;
use pdcore::graph::{Graph, NodeId, PortId};
use pdcore::node::NodeKind;
use pdcore::patch::{load, serialize};
use pdcore::plan::Plan;
use proptest::prelude::*;
use proptest::sample::Index;

fn kind_strategy() -> impl Strategy<Value = NodeKind> {
    prop_oneof![
        (1.0f32..2000.0).prop_map(|freq| NodeKind::Osc { freq }),
        (0.1f32..50.0).prop_map(|freq| NodeKind::Phasor { freq }),
        (-1.0f32..1.0).prop_map(|value| NodeKind::Sig { value }),
        (1u32..10_000).prop_map(|seed| NodeKind::Noise { seed }),
        (-2.0f32..2.0).prop_map(|gain| NodeKind::Gain { gain }),
        Just(NodeKind::Multiply),
        (1usize..=8).prop_map(|inputs| NodeKind::Mixer { inputs }),
        (0.0f32..20_000.0).prop_map(|cutoff| NodeKind::Lowpass { cutoff }),
        (0.0f32..500.0, 0.0f32..2000.0).prop_map(|(attack_ms, decay_ms)| NodeKind::Envelope {
            attack_ms,
            decay_ms
        }),
        (0usize..2).prop_map(|channel| NodeKind::Adc { channel }),
        Just(NodeKind::Through),
    ]
}

type Link = (Index, Index, usize, bool);

fn link_strategy() -> impl Strategy<Value = Vec<Link>> {
    prop::collection::vec((any::<Index>(), any::<Index>(), 0usize..8, any::<bool>()), 0..24)
}

fn target_strategy() -> impl Strategy<Value = Vec<(usize, Index)>> {
    prop::collection::vec((0usize..4, any::<Index>()), 0..6)
}

fn config() -> EngineConfig {
    EngineConfig {
        channels_in: 2,
        ..EngineConfig::default()
    }
}

/// Forward links go from lower to higher ids; `back` links become feedback
/// edges pointing the other way. A leading `sig~` feeds every required input
/// the links left open, and a `dac~` listens to the last node.
fn build(kinds: &[NodeKind], links: &[Link], targets: &[(usize, Index)]) -> Graph {
    let mut graph = Graph::new();
    let feed = graph.add_node(NodeKind::Sig { value: 0.5 });
    let ids: Vec<NodeId> = kinds.iter().cloned().map(|k| graph.add_node(k)).collect();
    for (a, b, port, back) in links {
        let x = a.index(ids.len());
        let y = b.index(ids.len());
        let (lo, hi) = (x.min(y), x.max(y));
        let (from, to) = if *back { (hi, lo) } else { (lo, hi) };
        if from == to && !back {
            continue;
        }
        if kinds[from].output_count() == 0 {
            continue;
        }
        let inputs = kinds[to].input_count();
        if inputs == 0 {
            continue;
        }
        // Duplicates are refused; that is fine here.
        let _ = if *back {
            graph.connect_feedback(ids[from], 0, ids[to], port % inputs)
        } else {
            graph.connect(ids[from], 0, ids[to], port % inputs)
        };
    }
    for (kind, &id) in kinds.iter().zip(&ids) {
        for port in 0..kind.required_inputs() {
            let open = !graph
                .edges()
                .iter()
                .any(|e| e.to_node == id && e.to_port == PortId(port));
            if open {
                graph.connect(feed, 0, id, port).unwrap();
            }
        }
    }
    for (name, node) in targets {
        let name = format!("t{}", name);
        graph.add_target(&name, ids[node.index(ids.len())]).unwrap();
    }
    let dac = graph.add_node(NodeKind::Dac { channel: 0 });
    graph.connect(ids[ids.len() - 1], 0, dac, 0).unwrap();
    graph
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_graphs_have_sound_order(
        kinds in prop::collection::vec(kind_strategy(), 1..12),
        links in link_strategy(),
        targets in target_strategy(),
    ) {
        let graph = build(&kinds, &links, &targets);
        prop_assert_eq!(graph.validate(), Ok(()));

        let order = graph.topological_order().unwrap().to_vec();
        let mut sorted = order.clone();
        sorted.sort();
        let all: Vec<NodeId> = (0..graph.node_count()).map(NodeId).collect();
        prop_assert_eq!(sorted, all);

        let position = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        for edge in graph.edges().iter().filter(|e| !e.feedback) {
            prop_assert!(position(edge.from_node) < position(edge.to_node));
        }
    }

    #[test]
    fn compile_is_deterministic(
        kinds in prop::collection::vec(kind_strategy(), 1..12),
        links in link_strategy(),
        targets in target_strategy(),
    ) {
        let graph = build(&kinds, &links, &targets);
        let config = config();
        let first = Plan::compile(&graph, &config).unwrap();
        let second = Plan::compile(&graph.clone(), &config).unwrap();
        prop_assert_eq!(&first.order, &second.order);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn serialized_patches_load_back(
        kinds in prop::collection::vec(kind_strategy(), 1..12),
        links in link_strategy(),
        targets in target_strategy(),
    ) {
        let graph = build(&kinds, &links, &targets);
        let text = serialize(&graph);
        let loaded = load(&text).unwrap();
        prop_assert_eq!(&loaded, &graph);
        prop_assert_eq!(serialize(&loaded), text);
    }
}
