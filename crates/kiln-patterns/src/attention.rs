//! Attention-shaped regions.

use kiln_common::ElementType;
use kiln_graph::{Graph, NodeId, NodeView, OpKind};

/// Longest chain walked from the first to the second MatMul of an MHA block.
pub const MAX_MHA_CHAIN: usize = 8;

/// Whether the native attention kernel accepts this SDPA node.
///
/// Query, key and value must be rank 3 or 4 with a real type the kernel
/// computes in.
pub fn is_supported_sdpa(view: &NodeView<'_>) -> bool {
    if !matches!(view.op(), OpKind::ScaledDotProductAttention { .. }) {
        return false;
    }
    (0..3).all(|port| {
        view.input_desc(port).is_some_and(|d| {
            matches!(d.element_type, ElementType::F32 | ElementType::Bf16 | ElementType::F16)
                && d.shape.rank().is_some_and(|r| (3..=4).contains(&r))
        })
    })
}

/// Whether an SDPA node should survive as one fused operation.
///
/// The native kernel only pays off for stateful (LLM-style) models.
pub fn keeps_fused_sdpa(view: &NodeView<'_>) -> bool {
    is_supported_sdpa(view) && view.graph().is_stateful()
}

pub fn has_paged_attention(graph: &Graph) -> bool {
    graph.nodes().any(|n| matches!(n.op, OpKind::PagedAttention))
}

pub fn is_stateful(graph: &Graph) -> bool {
    graph.is_stateful()
}

/// Nodes allowed between the two MatMuls of an MHA block.
fn is_mha_interior(op: &OpKind) -> bool {
    matches!(
        op,
        OpKind::Softmax { .. }
            | OpKind::Add
            | OpKind::Multiply
            | OpKind::Divide
            | OpKind::Reshape { .. }
            | OpKind::Transpose { .. }
            | OpKind::Convert { .. }
    )
}

/// A matched `MatMul -> ... -> Softmax -> ... -> MatMul` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MhaRegion {
    pub first_matmul: NodeId,
    pub interior: Vec<NodeId>,
    pub second_matmul: NodeId,
}

impl MhaRegion {
    /// Every node in the region, first MatMul first.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::with_capacity(self.interior.len() + 2);
        nodes.push(self.first_matmul);
        nodes.extend(&self.interior);
        nodes.push(self.second_matmul);
        nodes
    }
}

/// Walk the single-consumer chain from a first MatMul to the second one.
///
/// Every hop must have exactly one consumer and be an attention interior
/// operation; the chain must pass through a Softmax.
pub fn match_mha(view: &NodeView<'_>) -> Option<MhaRegion> {
    if !view.op().is_matmul() {
        return None;
    }
    let mut interior = Vec::new();
    let mut saw_softmax = false;
    let mut current = *view;
    for _ in 0..=MAX_MHA_CHAIN {
        let consumers = current.consumers();
        let [next] = consumers.as_slice() else {
            return None;
        };
        let next = *next;
        if next.op().is_matmul() {
            return (saw_softmax && next.input(0).map(|p| p.id()) == Some(current.id())).then(|| {
                MhaRegion { first_matmul: view.id(), interior, second_matmul: next.id() }
            });
        }
        if !is_mha_interior(next.op()) {
            return None;
        }
        saw_softmax |= matches!(next.op(), OpKind::Softmax { .. });
        interior.push(next.id());
        current = next;
    }
    None
}

/// The second MatMul of the MHA block starting at `view`.
pub fn find_mha_second_matmul<'g>(view: &NodeView<'g>) -> Option<NodeView<'g>> {
    let region = match_mha(view)?;
    NodeView::new(view.graph(), region.second_matmul)
}

/// Three or more MatMuls sharing one activation against constant `[N, K]`
/// weights, the shape a fused QKV projection replaces.
///
/// Returns the MatMuls in id order.
pub fn qkv_projection_candidates(view: &NodeView<'_>) -> Option<Vec<NodeId>> {
    let activation_type = view.output(0)?.element_type;
    if !matches!(activation_type, ElementType::Bf16 | ElementType::F32) {
        return None;
    }
    let matmuls: Vec<NodeId> = view
        .consumers()
        .iter()
        .filter(|c| {
            matches!(c.op(), OpKind::MatMul { transpose_a: false, transpose_b: true })
                && c.input(0).map(|p| p.id()) == Some(view.id())
                && c.input(1).is_some_and(|w| {
                    w.op().is_constant() && w.output(0).and_then(|d| d.shape.rank()) == Some(2)
                })
        })
        .map(|c| c.id())
        .collect();
    (matmuls.len() >= 3).then_some(matmuls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::PartialShape;

    fn mha(with_softmax: bool) -> (Graph, NodeId, NodeId) {
        let mut g = Graph::new("mha");
        let shape = PartialShape::from_static(&[1, 4, 16, 16]);
        let q = g.add_parameter("q", ElementType::F32, shape.clone());
        let k = g.add_parameter("k", ElementType::F32, shape.clone());
        let v = g.add_parameter("v", ElementType::F32, shape);
        let mm0 = g
            .add_node("mm0", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![
                q.into(),
                k.into(),
            ])
            .unwrap();
        let scale = g.add_scalar("scale", ElementType::F32, 0.125).unwrap();
        let mul = g.add_node("mul", OpKind::Multiply, vec![mm0.into(), scale.into()]).unwrap();
        let mid = if with_softmax {
            g.add_node("softmax", OpKind::Softmax { axis: -1 }, vec![mul.into()]).unwrap()
        } else {
            g.add_node("relu", OpKind::Relu, vec![mul.into()]).unwrap()
        };
        let mm1 = g
            .add_node("mm1", OpKind::MatMul { transpose_a: false, transpose_b: false }, vec![
                mid.into(),
                v.into(),
            ])
            .unwrap();
        g.add_result("out", mm1.into()).unwrap();
        (g, mm0, mm1)
    }

    #[test]
    fn finds_second_matmul_through_softmax() {
        let (g, mm0, mm1) = mha(true);
        let view = NodeView::new(&g, mm0).unwrap();
        assert_eq!(find_mha_second_matmul(&view).map(|v| v.id()), Some(mm1));
        assert_eq!(match_mha(&view).unwrap().nodes().len(), 4);
    }

    #[test]
    fn chain_without_softmax_is_not_mha() {
        let (g, mm0, _) = mha(false);
        assert!(find_mha_second_matmul(&NodeView::new(&g, mm0).unwrap()).is_none());
    }

    #[test]
    fn sdpa_is_kept_only_for_stateful_models() {
        let mut g = Graph::new("sdpa");
        let shape = PartialShape::from_static(&[1, 2, 8, 16]);
        let q = g.add_parameter("q", ElementType::F32, shape.clone());
        let k = g.add_parameter("k", ElementType::F32, shape.clone());
        let v = g.add_parameter("v", ElementType::F32, shape);
        let sdpa = g
            .add_node("sdpa", OpKind::ScaledDotProductAttention { causal: true }, vec![
                q.into(),
                k.into(),
                v.into(),
            ])
            .unwrap();
        assert!(is_supported_sdpa(&NodeView::new(&g, sdpa).unwrap()));
        assert!(!keeps_fused_sdpa(&NodeView::new(&g, sdpa).unwrap()));
        g.add_variable("past_key");
        assert!(keeps_fused_sdpa(&NodeView::new(&g, sdpa).unwrap()));
    }

    #[test]
    fn qkv_needs_three_constant_projections() {
        let mut g = Graph::new("qkv");
        let x = g.add_parameter("x", ElementType::Bf16, PartialShape::from_static(&[4, 32]));
        for name in ["q", "k", "v"] {
            let w = g.add_constant(format!("{name}.w"), ElementType::Bf16, &[32, 32], vec![0.5]).unwrap();
            g.add_node(name, OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![
                x.into(),
                w.into(),
            ])
            .unwrap();
        }
        let found = qkv_projection_candidates(&NodeView::new(&g, x).unwrap()).unwrap();
        assert_eq!(found.len(), 3);
        assert!(!has_paged_attention(&g));
    }
}
