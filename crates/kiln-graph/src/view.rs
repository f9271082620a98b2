//! Read-only node handles for matcher predicates.

use crate::graph::Graph;
use crate::node::{Node, NodeId, OpKind, OutputRef, TensorDesc};

/// A node together with the graph it lives in.
///
/// Predicates receive views so they can walk producers and consumers without
/// being able to mutate anything.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'g> {
    graph: &'g Graph,
    node: &'g Node,
}

impl<'g> NodeView<'g> {
    /// View of `id`, or `None` if the node is gone.
    pub fn new(graph: &'g Graph, id: NodeId) -> Option<Self> {
        graph.node(id).map(|node| Self { graph, node })
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn node(&self) -> &'g Node {
        self.node
    }

    pub fn op(&self) -> &'g OpKind {
        &self.node.op
    }

    pub fn name(&self) -> &'g str {
        &self.node.name
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub fn output(&self, port: usize) -> Option<&'g TensorDesc> {
        self.node.outputs.get(port)
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    /// Descriptor arriving at input `port`.
    pub fn input_desc(&self, port: usize) -> Option<&'g TensorDesc> {
        let src = self.node.inputs.get(port)?;
        self.graph.output_desc(*src)
    }

    /// Node producing input `port`.
    pub fn input(&self, port: usize) -> Option<NodeView<'g>> {
        let OutputRef { node, .. } = *self.node.inputs.get(port)?;
        Self::new(self.graph, node)
    }

    /// Distinct consumers of output `port`, in id order.
    pub fn consumers_of(&self, port: usize) -> Vec<NodeView<'g>> {
        self.graph
            .consumer_nodes(OutputRef::new(self.node.id, port))
            .into_iter()
            .filter_map(|id| Self::new(self.graph, id))
            .collect()
    }

    /// Distinct consumers of output 0.
    pub fn consumers(&self) -> Vec<NodeView<'g>> {
        self.consumers_of(0)
    }
}
