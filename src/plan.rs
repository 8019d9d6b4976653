//! Plan module: compile a validated graph into a flat, immutable execution plan.

use crate::config::EngineConfig;
use crate::control::Name;
use crate::graph::{Edge, Graph, GraphError, NodeId};
use crate::invariant_ppt::{assert_invariant, PLAN_SOUNDNESS};
use crate::node::NodeKind;
use std::ops::Range;

/// Where an input port reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Current-sample output slot.
    Slot(usize),
    /// Previous-sample delay cell of a feedback edge.
    Feedback(usize),
}

/// One node visit per frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    /// Node index, also the index of its runtime state.
    pub(crate) node: usize,
    /// Range into `Plan::port_spans`, one span per input port.
    pub(crate) ports: Range<usize>,
    /// Range into the runtime's output slots.
    pub(crate) outputs: Range<usize>,
}

/// A message target with its receivers resolved to node indices.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TargetEntry {
    pub(crate) name: Name,
    pub(crate) receivers: Range<usize>,
}

/// The compiled plan: processing order plus the flattened wiring the audio
/// context walks without lookups or allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Node processing order.
    pub order: Vec<NodeId>,
    /// The edges the plan was compiled from.
    pub edges: Vec<Edge>,
    /// Node kinds, indexed by node id.
    pub kinds: Vec<NodeKind>,
    /// Stream format the plan was compiled against.
    pub config: EngineConfig,
    pub(crate) steps: Vec<Step>,
    pub(crate) port_spans: Vec<Range<usize>>,
    pub(crate) sources: Vec<Source>,
    /// Output slot feeding each feedback edge's delay cell.
    pub(crate) feedback_sources: Vec<usize>,
    pub(crate) slot_count: usize,
    pub(crate) targets: Vec<TargetEntry>,
    pub(crate) receivers: Vec<usize>,
}

/// Errors during plan compilation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The graph failed validation.
    #[error("graph is not schedulable: {0}")]
    Invalid(#[from] GraphError),
    /// An `adc~`/`dac~` names a channel the stream does not have.
    #[error("node {node:?} uses {direction} channel {channel}, but the stream has {available}")]
    ChannelOutOfRange {
        /// Offending node.
        node: NodeId,
        /// Requested channel.
        channel: usize,
        /// Channels in the stream.
        available: usize,
        /// "input" or "output".
        direction: &'static str,
    },
}

impl Plan {
    /// Create a plan from a graph. Only graphs that pass validation compile.
    pub fn compile(graph: &Graph, config: &EngineConfig) -> Result<Self, PlanError> {
        graph.validate()?;
        let order = graph.topological_order()?.to_vec();
        let kinds: Vec<NodeKind> = graph.nodes().iter().map(|n| n.kind.clone()).collect();

        for (idx, kind) in kinds.iter().enumerate() {
            let (channel, available, direction) = match kind {
                NodeKind::Adc { channel } => (*channel, config.channels_in, "input"),
                NodeKind::Dac { channel } => (*channel, config.channels_out, "output"),
                _ => continue,
            };
            if channel >= available {
                return Err(PlanError::ChannelOutOfRange {
                    node: NodeId(idx),
                    channel,
                    available,
                    direction,
                });
            }
        }

        // Output slots are laid out by node id.
        let mut slot_base = Vec::with_capacity(kinds.len());
        let mut slot_count = 0;
        for kind in &kinds {
            slot_base.push(slot_count);
            slot_count += kind.output_count();
        }

        let edges = graph.edges().to_vec();
        let mut feedback_sources = Vec::new();
        let mut feedback_index = vec![None; edges.len()];
        for (i, edge) in edges.iter().enumerate() {
            if edge.feedback {
                feedback_index[i] = Some(feedback_sources.len());
                feedback_sources.push(slot_base[edge.from_node.0] + edge.from_port.0);
            }
        }

        let mut steps = Vec::with_capacity(order.len());
        let mut port_spans = Vec::new();
        let mut sources = Vec::with_capacity(edges.len());
        for &id in &order {
            let kind = &kinds[id.0];
            let first_port = port_spans.len();
            for port in 0..kind.input_count() {
                let start = sources.len();
                for (i, edge) in edges.iter().enumerate() {
                    if edge.to_node != id || edge.to_port.0 != port {
                        continue;
                    }
                    sources.push(match feedback_index[i] {
                        Some(cell) => Source::Feedback(cell),
                        None => Source::Slot(slot_base[edge.from_node.0] + edge.from_port.0),
                    });
                }
                port_spans.push(start..sources.len());
            }
            steps.push(Step {
                node: id.0,
                ports: first_port..port_spans.len(),
                outputs: slot_base[id.0]..slot_base[id.0] + kind.output_count(),
            });
        }

        let mut targets = Vec::with_capacity(graph.targets().len());
        let mut receivers = Vec::new();
        for target in graph.targets() {
            let name = Name::new(&target.name)
                .map_err(|_| GraphError::InvalidTargetName(target.name.clone()))?;
            let start = receivers.len();
            receivers.extend(target.receivers.iter().map(|id| id.0));
            targets.push(TargetEntry {
                name,
                receivers: start..receivers.len(),
            });
        }

        let plan = Self {
            order,
            edges,
            kinds,
            config: *config,
            steps,
            port_spans,
            sources,
            feedback_sources,
            slot_count,
            targets,
            receivers,
        };

        assert_invariant(
            PLAN_SOUNDNESS,
            plan.steps.len() == plan.kinds.len()
                && plan.sources.len() == plan.edges.len()
                && plan.slot_count == plan.kinds.iter().map(NodeKind::output_count).sum::<usize>(),
            "Plan covers every node, edge and output port exactly once",
            Some("Plan::compile"),
        );
        tracing::debug!(
            nodes = plan.kinds.len(),
            edges = plan.edges.len(),
            feedback = plan.feedback_sources.len(),
            targets = plan.targets.len(),
            "plan compiled"
        );
        Ok(plan)
    }

    /// Number of feedback edges, each with one delay cell.
    pub fn feedback_count(&self) -> usize {
        self.feedback_sources.len()
    }

    /// Target names in declaration order.
    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.name.as_str())
    }
}
