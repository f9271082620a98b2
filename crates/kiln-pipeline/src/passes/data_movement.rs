//! Moving elementwise work above reshapes and transposes so it can fuse
//! with its producer.

use super::input_of;
use crate::pass::Pass;
use kiln_graph::{Graph, NodeId, NodeView, OpKind, OutputRef};
use tracing::debug;

pub const MOVE_ELTWISE_UP_THROUGH_DATA_MOV: &str = "MoveEltwiseUpThroughDataMov";

/// Scalar-like operand: one element, rank 0 or 1.
fn is_scalar_operand(view: &NodeView<'_>, port: usize) -> bool {
    view.input_desc(port)
        .is_some_and(|d| d.shape.rank().is_some_and(|r| r <= 1) && d.shape.element_count() == Some(1))
}

/// An elementwise node (or FakeQuantize) fed by a single-consumer reshape
/// or transpose, whose other operands are all scalars.
fn is_movable(view: &NodeView<'_>) -> bool {
    let op = view.op();
    if !(op.is_elementwise() || matches!(op, OpKind::FakeQuantize { .. })) {
        return false;
    }
    let Some(data_movement) = view.input(0) else {
        return false;
    };
    if !matches!(data_movement.op(), OpKind::Reshape { .. } | OpKind::Transpose { .. })
        || data_movement.consumers().len() != 1
        || view.graph().all_consumers(data_movement.id()).len() != 1
    {
        return false;
    }
    (1..view.input_count()).all(|port| is_scalar_operand(view, port))
}

/// `D(x) -> E` becomes `E(x) -> D`.
fn swap(graph: &mut Graph, eltwise: NodeId) -> kiln_graph::Result<bool> {
    let Some(movement) = input_of(graph, eltwise, 0).map(|src| src.node) else {
        return Ok(false);
    };
    let Some(source) = input_of(graph, movement, 0) else {
        return Ok(false);
    };
    let (Some(e), Some(d)) = (graph.node(eltwise), graph.node(movement)) else {
        return Ok(false);
    };
    let (e_name, e_op) = (e.name.clone(), e.op.clone());
    let (d_name, d_op) = (d.name.clone(), d.op.clone());
    let mut inputs: Vec<OutputRef> = e.inputs.clone();
    inputs[0] = source;

    let moved = graph.add_node(e_name, e_op, inputs)?;
    let restored = graph.add_node(d_name, d_op, vec![moved.into()])?;
    graph.replace_node(eltwise, restored)?;
    Ok(true)
}

/// Hoists elementwise nodes above the reshape or transpose feeding them.
pub fn move_eltwise_up_through_data_mov() -> Pass {
    Pass::from_fn(MOVE_ELTWISE_UP_THROUGH_DATA_MOV, |graph, scope| {
        let candidates = scope.candidates(graph, is_movable)?;
        let mut moved = 0usize;
        for id in candidates {
            let still_movable = NodeView::new(graph, id).is_some_and(|v| is_movable(&v));
            if still_movable && swap(graph, id)? {
                moved += 1;
            }
        }
        if moved > 0 {
            let removed = graph.remove_dead_nodes();
            debug!(moved, removed, "moved elementwise nodes above data movement");
        }
        Ok(moved > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::{ElementType, InputRef, PartialShape};

    #[test]
    fn relu_moves_above_transpose() {
        let mut g = Graph::new("mov");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 3]));
        let t = g.add_node("t", OpKind::Transpose { order: vec![1, 0] }, vec![x.into()]).unwrap();
        let r = g.add_node("relu", OpKind::Relu, vec![t.into()]).unwrap();
        let out = g.add_result("out", r.into()).unwrap();

        assert!(move_eltwise_up_through_data_mov().apply(&mut g).unwrap());
        g.validate().unwrap();
        let last = g.producer(InputRef::new(out, 0)).unwrap();
        let last = g.node(last.node).unwrap();
        assert_eq!(last.name, "t");
        let first = g.producer(InputRef::new(last.id, 0)).unwrap();
        assert_eq!(g.node(first.node).unwrap().name, "relu");
        assert_eq!(last.outputs[0].shape, PartialShape::from_static(&[3, 2]));
    }

    #[test]
    fn per_channel_operand_blocks_the_move() {
        let mut g = Graph::new("mov");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 3]));
        let t = g.add_node("t", OpKind::Transpose { order: vec![1, 0] }, vec![x.into()]).unwrap();
        let bias = g.add_constant("bias", ElementType::F32, &[2], vec![1.0, 2.0]).unwrap();
        let add = g.add_node("add", OpKind::Add, vec![t.into(), bias.into()]).unwrap();
        g.add_result("out", add.into()).unwrap();
        assert!(!move_eltwise_up_through_data_mov().apply(&mut g).unwrap());
    }

    #[test]
    fn shared_reshape_is_not_touched() {
        let mut g = Graph::new("mov");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 3]));
        let r = g.add_node("r", OpKind::Reshape { target: vec![6] }, vec![x.into()]).unwrap();
        let a = g.add_node("a", OpKind::Relu, vec![r.into()]).unwrap();
        g.add_result("out_a", a.into()).unwrap();
        g.add_result("out_r", r.into()).unwrap();
        assert!(!move_eltwise_up_through_data_mov().apply(&mut g).unwrap());
    }
}
