//! Graph module: signal graphs with validation and a cached processing order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::control::Name;
use crate::invariant_ppt::{
    assert_invariant, GRAPH_LEGALITY, GRAPH_REJECTS_INVALID, TOPO_ORDER_SOUND,
};
use crate::node::{KindError, NodeKind};
use std::cell::OnceCell;
use std::collections::VecDeque;

/// Unique identifier for a node: its insertion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Index of an input or output port on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub usize);

/// An edge connecting an output port to an input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    /// The source node ID.
    pub from_node: NodeId,
    /// The source output port.
    pub from_port: PortId,
    /// The destination node ID.
    pub to_node: NodeId,
    /// The destination input port.
    pub to_port: PortId,
    /// Reads the source's value from the previous frame (a one-sample delay,
    /// not a one-block delay), which lets it close a cycle.
    pub feedback: bool,
}

impl Edge {
    /// A plain forward edge.
    pub fn new(from_node: NodeId, from_port: PortId, to_node: NodeId, to_port: PortId) -> Self {
        Self {
            from_node,
            from_port,
            to_node,
            to_port,
            feedback: false,
        }
    }

    fn same_endpoints(&self, other: &Edge) -> bool {
        self.from_node == other.from_node
            && self.from_port == other.from_port
            && self.to_node == other.to_node
            && self.to_port == other.to_port
    }
}

/// A node in the graph.
#[derive(Debug, Clone)]
pub struct NodeData {
    /// The unique ID of this node.
    pub id: NodeId,
    /// The kind of this node and its creation parameters.
    pub kind: NodeKind,
    /// Name the node was declared under, if any.
    pub label: Option<String>,
}

/// A named message target and the nodes that receive its messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Receiver name.
    pub name: String,
    /// Receiving nodes, in declaration order.
    pub receivers: Vec<NodeId>,
}

/// Errors that can occur when building or validating the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Node does not exist.
    #[error("node {0:?} does not exist")]
    UnknownNode(NodeId),
    /// Port index out of bounds for the node's kind.
    #[error("{direction} port {port} is out of range for node {node:?}")]
    InvalidPort {
        /// Node the port was looked up on.
        node: NodeId,
        /// Requested port index.
        port: usize,
        /// "input" or "output".
        direction: &'static str,
    },
    /// The same two ports are already connected.
    #[error("edge {0:?} already exists")]
    DuplicateEdge(Edge),
    /// A cycle made only of non-feedback edges passes through this node.
    #[error("cycle through node {node:?} without a feedback edge")]
    Cycle {
        /// A node on the cycle.
        node: NodeId,
    },
    /// A required input port has no incoming edge.
    #[error("input port {port} of node {node:?} must be connected")]
    UnconnectedInput {
        /// The node missing an input.
        node: NodeId,
        /// The unconnected port.
        port: usize,
    },
    /// The name cannot be used as a message target.
    #[error("invalid message target name `{0}`")]
    InvalidTargetName(String),
    /// A node was created with parameters its kind does not accept.
    #[error("node {node:?}: {source}")]
    InvalidParameters {
        /// The offending node.
        node: NodeId,
        /// What is wrong with its parameters.
        source: KindError,
    },
}

/// The signal graph: nodes, edges, and named message targets.
///
/// Any structural mutation drops the cached processing order; it is
/// recomputed on the next call to [`Graph::topological_order`].
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<NodeData>,
    edges: Vec<Edge>,
    targets: Vec<Target>,
    order: OnceCell<Result<Vec<NodeId>, GraphError>>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        self.push_node(kind, None)
    }

    /// Add a node that remembers the name it was declared under.
    pub fn add_labeled_node(&mut self, kind: NodeKind, label: &str) -> NodeId {
        self.push_node(kind, Some(label.to_string()))
    }

    fn push_node(&mut self, kind: NodeKind, label: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData { id, kind, label });
        self.invalidate();
        id
    }

    /// Connect an output port to an input port.
    pub fn connect(
        &mut self,
        from_node: NodeId,
        from_port: usize,
        to_node: NodeId,
        to_port: usize,
    ) -> Result<(), GraphError> {
        self.add_edge(Edge::new(from_node, PortId(from_port), to_node, PortId(to_port)))
    }

    /// Connect with a feedback edge, which may close a cycle.
    pub fn connect_feedback(
        &mut self,
        from_node: NodeId,
        from_port: usize,
        to_node: NodeId,
        to_port: usize,
    ) -> Result<(), GraphError> {
        self.add_edge(Edge {
            feedback: true,
            ..Edge::new(from_node, PortId(from_port), to_node, PortId(to_port))
        })
    }

    /// Add an edge after checking nodes, ports, and duplicates.
    ///
    /// Cycles are accepted here and rejected by [`Graph::validate`].
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        self.check_edge(&edge)?;
        if let Some(existing) = self.edges.iter().find(|e| e.same_endpoints(&edge)) {
            return Err(GraphError::DuplicateEdge(*existing));
        }
        self.edges.push(edge);
        self.invalidate();

        assert_invariant(
            GRAPH_LEGALITY,
            self.check_edge(&edge).is_ok(),
            "Edge added, endpoints remain legal",
            Some("add_edge"),
        );
        Ok(())
    }

    /// Remove an edge with the same endpoints; returns whether one existed.
    pub fn disconnect(&mut self, edge: &Edge) -> bool {
        let before = self.edges.len();
        self.edges.retain(|e| !e.same_endpoints(edge));
        let removed = self.edges.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Route messages sent to `name` to `node`. Repeated names accumulate receivers.
    pub fn add_target(&mut self, name: &str, node: NodeId) -> Result<(), GraphError> {
        Name::new(name).map_err(|_| GraphError::InvalidTargetName(name.to_string()))?;
        self.node(node).ok_or(GraphError::UnknownNode(node))?;
        match self.targets.iter_mut().find(|t| t.name == name) {
            Some(target) => {
                if !target.receivers.contains(&node) {
                    target.receivers.push(node);
                }
            }
            None => self.targets.push(Target {
                name: name.to_string(),
                receivers: vec![node],
            }),
        }
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id.0)
    }

    /// All nodes, indexed by `NodeId`.
    pub fn nodes(&self) -> &[NodeData] {
        &self.nodes
    }

    /// All edges, in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// All message targets, in declaration order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Find a node by the label it was declared under.
    pub fn find_label(&self, label: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.label.as_deref() == Some(label))
            .map(|n| n.id)
    }

    /// Check the graph is schedulable.
    ///
    /// Fails on dangling references, out-of-range node parameters, unconnected
    /// required inputs, and cycles that contain no feedback edge.
    pub fn validate(&self) -> Result<(), GraphError> {
        let result = self.check_structure();
        if result.is_err() {
            assert_invariant(
                GRAPH_REJECTS_INVALID,
                result.is_err(),
                "Invalid graph rejected",
                Some("validate"),
            );
        }
        result
    }

    fn check_structure(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            self.check_edge(edge)?;
        }
        for target in &self.targets {
            for &node in &target.receivers {
                self.node(node).ok_or(GraphError::UnknownNode(node))?;
            }
        }
        for node in &self.nodes {
            node.kind
                .check()
                .map_err(|source| GraphError::InvalidParameters {
                    node: node.id,
                    source,
                })?;
            for port in 0..node.kind.required_inputs() {
                let connected = self
                    .edges
                    .iter()
                    .any(|e| e.to_node == node.id && e.to_port == PortId(port));
                if !connected {
                    return Err(GraphError::UnconnectedInput {
                        node: node.id,
                        port,
                    });
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Processing order over non-feedback edges.
    ///
    /// Nodes are ordered by dependency depth (longest path from a source),
    /// then by insertion order, so the result is identical across calls and runs.
    /// Cached until the next structural mutation.
    pub fn topological_order(&self) -> Result<&[NodeId], GraphError> {
        match self.order.get_or_init(|| self.compute_order()) {
            Ok(order) => Ok(order),
            Err(e) => Err(e.clone()),
        }
    }

    fn invalidate(&mut self) {
        self.order = OnceCell::new();
    }

    fn check_edge(&self, edge: &Edge) -> Result<(), GraphError> {
        let from = self
            .node(edge.from_node)
            .ok_or(GraphError::UnknownNode(edge.from_node))?;
        let to = self
            .node(edge.to_node)
            .ok_or(GraphError::UnknownNode(edge.to_node))?;
        if edge.from_port.0 >= from.kind.output_count() {
            return Err(GraphError::InvalidPort {
                node: edge.from_node,
                port: edge.from_port.0,
                direction: "output",
            });
        }
        if edge.to_port.0 >= to.kind.input_count() {
            return Err(GraphError::InvalidPort {
                node: edge.to_node,
                port: edge.to_port.0,
                direction: "input",
            });
        }
        Ok(())
    }

    fn compute_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in self.edges.iter().filter(|e| !e.feedback) {
            adj[edge.from_node.0].push(edge.to_node.0);
            in_degree[edge.to_node.0] += 1;
        }

        let mut depth = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for &next in &adj[node] {
                depth[next] = depth[next].max(depth[node] + 1);
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if visited != n {
            return Err(GraphError::Cycle {
                node: self.node_on_cycle(&in_degree),
            });
        }

        let mut order: Vec<NodeId> = (0..n).map(NodeId).collect();
        order.sort_by_key(|id| (depth[id.0], id.0));

        assert_invariant(
            TOPO_ORDER_SOUND,
            self.order_respects_edges(&order),
            "Order respects every forward edge",
            Some("topological_order"),
        );
        Ok(order)
    }

    /// Walk backwards through nodes Kahn's algorithm could not release until
    /// a node repeats; that node lies on a cycle.
    fn node_on_cycle(&self, remaining: &[usize]) -> NodeId {
        let Some(mut current) = remaining.iter().position(|&d| d > 0) else {
            return NodeId(0);
        };
        let mut seen = vec![false; remaining.len()];
        while !seen[current] {
            seen[current] = true;
            let pred = self
                .edges
                .iter()
                .filter(|e| !e.feedback && e.to_node.0 == current)
                .map(|e| e.from_node.0)
                .find(|&from| remaining[from] > 0);
            match pred {
                Some(p) => current = p,
                None => break,
            }
        }
        NodeId(current)
    }

    fn order_respects_edges(&self, order: &[NodeId]) -> bool {
        let mut position = vec![0usize; order.len()];
        for (pos, id) in order.iter().enumerate() {
            position[id.0] = pos;
        }
        self.edges
            .iter()
            .filter(|e| !e.feedback)
            .all(|e| position[e.from_node.0] < position[e.to_node.0])
    }
}

/// Structural equality: same kinds at the same ids, same edge set, same targets.
/// Labels are ignored.
impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        if self.nodes.len() != other.nodes.len()
            || self
                .nodes
                .iter()
                .zip(&other.nodes)
                .any(|(a, b)| a.kind != b.kind)
        {
            return false;
        }
        let mut ours = self.edges.clone();
        let mut theirs = other.edges.clone();
        ours.sort();
        theirs.sort();
        if ours != theirs {
            return false;
        }
        let normalize = |targets: &[Target]| {
            let mut t: Vec<(String, Vec<NodeId>)> = targets
                .iter()
                .map(|t| {
                    let mut r = t.receivers.clone();
                    r.sort();
                    (t.name.clone(), r)
                })
                .collect();
            t.sort();
            t
        };
        normalize(&self.targets) == normalize(&other.targets)
    }
}
