//! DSL module: builder API for graphs with named nodes.

use crate::graph::{Graph, GraphError, NodeId};
use crate::node::NodeKind;
use std::collections::HashMap;

/// Handle to a node in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle(pub NodeId);

/// The graph builder.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
    node_names: HashMap<String, NodeId>,
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DslError {
    /// The graph refused the operation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// No node was declared under this name.
    #[error("no node named `{0}`")]
    MissingNode(String),
    /// A node was already declared under this name.
    #[error("node name `{0}` is already taken")]
    DuplicateName(String),
}

impl GraphBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an anonymous node.
    pub fn node(&mut self, kind: NodeKind) -> NodeHandle {
        NodeHandle(self.graph.add_node(kind))
    }

    /// Add a named node.
    pub fn node_named(&mut self, name: &str, kind: NodeKind) -> Result<NodeHandle, DslError> {
        if self.node_names.contains_key(name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        let id = self.graph.add_labeled_node(kind, name);
        self.node_names.insert(name.to_string(), id);
        Ok(NodeHandle(id))
    }

    /// Resolve a node name.
    pub fn lookup(&self, name: &str) -> Result<NodeHandle, DslError> {
        self.node_names
            .get(name)
            .map(|&id| NodeHandle(id))
            .ok_or_else(|| DslError::MissingNode(name.to_string()))
    }

    /// Connect two ports.
    pub fn connect(
        &mut self,
        from: NodeHandle,
        from_port: usize,
        to: NodeHandle,
        to_port: usize,
    ) -> Result<&mut Self, DslError> {
        self.graph.connect(from.0, from_port, to.0, to_port)?;
        Ok(self)
    }

    /// Connect two ports with a feedback edge.
    pub fn feedback(
        &mut self,
        from: NodeHandle,
        from_port: usize,
        to: NodeHandle,
        to_port: usize,
    ) -> Result<&mut Self, DslError> {
        self.graph.connect_feedback(from.0, from_port, to.0, to_port)?;
        Ok(self)
    }

    /// Route messages for `target` to `node`.
    pub fn receive(&mut self, target: &str, node: NodeHandle) -> Result<&mut Self, DslError> {
        self.graph.add_target(target, node.0)?;
        Ok(self)
    }

    /// Build the graph. Validation is left to the caller.
    pub fn build(self) -> Graph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsl_equivalence() {
        let mut builder = GraphBuilder::new();
        let osc = builder.node_named("osc", NodeKind::Osc { freq: 440.0 }).unwrap();
        let dac = builder.node_named("out", NodeKind::Dac { channel: 0 }).unwrap();
        builder.connect(osc, 0, dac, 0).unwrap();
        builder.receive("pitch", osc).unwrap();
        let dsl_graph = builder.build();

        let mut manual_graph = Graph::new();
        let m_osc = manual_graph.add_node(NodeKind::Osc { freq: 440.0 });
        let m_dac = manual_graph.add_node(NodeKind::Dac { channel: 0 });
        manual_graph.connect(m_osc, 0, m_dac, 0).unwrap();
        manual_graph.add_target("pitch", m_osc).unwrap();

        assert_eq!(dsl_graph, manual_graph);
        assert_eq!(dsl_graph.find_label("out"), Some(m_dac));
    }

    #[test]
    fn name_errors() {
        let mut builder = GraphBuilder::new();
        builder.node_named("a", NodeKind::Through).unwrap();
        assert_eq!(
            builder.node_named("a", NodeKind::Through).unwrap_err(),
            DslError::DuplicateName("a".into())
        );
        assert_eq!(
            builder.lookup("b").unwrap_err(),
            DslError::MissingNode("b".into())
        );
    }
}
