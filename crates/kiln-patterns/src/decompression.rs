//! Weight-decompression pattern detection.
//!
//! Compressed weights reach a matrix multiply as
//! `Constant(u8) -> Convert -> [Subtract] -> Multiply(scale) -> MatMul`,
//! sometimes with a `Reshape` or a `Convert` between the scale multiply and
//! the matrix multiply.

use kiln_graph::{NodeView, OpKind};

/// Every distinct consumer of output 0 satisfies `kind`.
///
/// An output with no consumers satisfies any kind.
pub fn all_consumers_are(view: &NodeView<'_>, kind: impl Fn(&OpKind) -> bool) -> bool {
    view.consumers().iter().all(|c| kind(c.op()))
}

/// At least one consumer of output 0 is a matrix multiply.
pub fn has_matmul_consumer(view: &NodeView<'_>) -> bool {
    view.consumers().iter().any(|c| c.op().is_matmul())
}

fn is_reshape(op: &OpKind) -> bool {
    matches!(op, OpKind::Reshape { .. })
}

/// `nodes` are all converts and every one of them feeds only matrix multiplies.
fn converts_feed_matmuls(nodes: &[NodeView<'_>]) -> bool {
    nodes.iter().all(|n| n.op().is_convert())
        && nodes.iter().all(|n| all_consumers_are(n, OpKind::is_matmul))
}

/// Whether a multiply rescales decompressed weights for a matrix multiply.
///
/// Looks at most two hops downstream:
///
/// 1. every consumer is a `MatMul`;
/// 2. every consumer is a `Reshape`, and for some reshape either every
///    consumer is a `MatMul` or every consumer is a `Convert` feeding only
///    `MatMul`s;
/// 3. every consumer is a `Convert` feeding only `MatMul`s.
///
/// Deeper chains are not detected.
pub fn is_decompression_multiply(view: &NodeView<'_>) -> bool {
    if !matches!(view.op(), OpKind::Multiply) {
        return false;
    }
    let consumers = view.consumers();
    if consumers.iter().all(|c| c.op().is_matmul()) {
        return true;
    }

    if consumers.iter().all(|c| is_reshape(c.op())) {
        let via_reshape = consumers.iter().any(|reshape| {
            let next = reshape.consumers();
            next.iter().all(|n| n.op().is_matmul()) || converts_feed_matmuls(&next)
        });
        if via_reshape {
            return true;
        }
    }

    converts_feed_matmuls(&consumers)
}

/// A node fed by exactly one consumer edge that is a decompression multiply.
///
/// Used to keep low-precision folding away from weight decompression chains.
pub fn feeds_decompression_multiply(view: &NodeView<'_>) -> bool {
    let consumers = view.consumers();
    match consumers.as_slice() {
        [only] => is_decompression_multiply(only),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::{ElementType, Graph, NodeId, PartialShape};

    /// `w(u8) -> Convert -> Multiply(scale)`; returns the graph and the multiply.
    fn scaled_weights() -> (Graph, NodeId) {
        let mut g = Graph::new("w");
        let w = g.add_constant("w", ElementType::U8, &[4, 8], vec![3.0]).unwrap();
        let cvt = g
            .add_node("w/cvt", OpKind::Convert { destination: ElementType::F32 }, vec![w.into()])
            .unwrap();
        let scale = g.add_constant("scale", ElementType::F32, &[4, 1], vec![0.1]).unwrap();
        let mul = g.add_node("w/mul", OpKind::Multiply, vec![cvt.into(), scale.into()]).unwrap();
        (g, mul)
    }

    #[test]
    fn non_multiply_never_qualifies() {
        let (g, mul) = scaled_weights();
        let cvt = NodeView::new(&g, mul).unwrap().input(0).unwrap();
        assert!(!is_decompression_multiply(&cvt));
    }

    #[test]
    fn convert_then_matmul_qualifies() {
        let (mut g, mul) = scaled_weights();
        let x = g.add_parameter("x", ElementType::F16, PartialShape::from_static(&[2, 8]));
        let cvt = g
            .add_node("mul/cvt", OpKind::Convert { destination: ElementType::F16 }, vec![mul.into()])
            .unwrap();
        g.add_node("mm", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![
            x.into(),
            cvt.into(),
        ])
        .unwrap();
        assert!(is_decompression_multiply(&NodeView::new(&g, mul).unwrap()));
    }

    #[test]
    fn mixed_consumers_do_not_qualify() {
        let (mut g, mul) = scaled_weights();
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 8]));
        g.add_node("mm", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![
            x.into(),
            mul.into(),
        ])
        .unwrap();
        g.add_node("relu", OpKind::Relu, vec![mul.into()]).unwrap();
        assert!(!is_decompression_multiply(&NodeView::new(&g, mul).unwrap()));
        assert!(has_matmul_consumer(&NodeView::new(&g, mul).unwrap()));
    }
}
