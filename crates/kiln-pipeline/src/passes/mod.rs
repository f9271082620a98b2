//! Representative rewrite passes.
//!
//! Each constructor returns a [`Pass`](crate::Pass) value; stages decide the
//! tier and predicate. Rewrites only touch nodes their scope admits.

pub mod data_movement;
pub mod decompose;
pub mod low_precision;
pub mod marking;
pub mod precision;
pub mod qkv;
pub mod simplify;
pub mod tokenize;

use kiln_graph::{ConstantData, ElementType, Graph, InputRef, NodeId, OutputRef};

// ── Shared helpers ───────────────────────────────────────────────────

pub(crate) fn constant_of(graph: &Graph, id: NodeId) -> Option<&ConstantData> {
    match &graph.node(id)?.op {
        kiln_graph::OpKind::Constant(data) => Some(data),
        _ => None,
    }
}

/// The single value of a uniform constant.
pub(crate) fn uniform_value(data: &ConstantData) -> Option<f64> {
    data.is_uniform().then(|| data.values.first().copied()).flatten()
}

pub(crate) fn output_type(graph: &Graph, output: OutputRef) -> Option<ElementType> {
    graph.output_desc(output).map(|d| d.element_type)
}

/// Producer of input `port` of `id`.
pub(crate) fn input_of(graph: &Graph, id: NodeId, port: usize) -> Option<OutputRef> {
    graph.producer(InputRef::new(id, port))
}

pub(crate) fn name_of(graph: &Graph, id: NodeId) -> String {
    graph.node(id).map(|n| n.name.clone()).unwrap_or_default()
}
