//! Structural clean-ups: constant folding, identity converts, transposes
//! absorbed into matrix multiplies.

use super::{constant_of, input_of};
use crate::pass::Pass;
use kiln_graph::{Graph, InputRef, NodeId, NodeView, OpKind, Tensor, evaluate_op};
use tracing::{debug, trace};

pub const CONSTANT_FOLDING: &str = "ConstantFolding";
pub const ELIMINATE_CONVERT: &str = "EliminateConvert";
pub const TRANSPOSE_MATMUL: &str = "TransposeMatMul";

// ── Constant folding ─────────────────────────────────────────────────

/// Nodes folding may replace, judged before their inputs are known.
fn is_fold_target(view: &NodeView<'_>) -> bool {
    let node = view.node();
    let op = view.op();
    let stateful = matches!(op, OpKind::ReadValue { .. } | OpKind::Assign { .. });
    let protected = node.rt.dequantization
        || node.rt.decompression
        || (op.is_convert() && node.rt.keep_precision);
    !op.is_source() && !op.is_sink() && !stateful && !protected && node.outputs.len() == 1
}

/// Value of `id` if every input is already known at compile time.
fn fold_value(graph: &Graph, id: NodeId) -> Option<Tensor> {
    let node = graph.node(id)?;
    if let OpKind::ShapeOf { output_type } = node.op {
        let dims = graph.output_desc(*node.inputs.first()?)?.shape.to_static()?;
        let values = dims.iter().map(|&d| d as f64).collect();
        return Some(Tensor::new(output_type, vec![dims.len()], values));
    }
    if node.inputs.is_empty() {
        return None;
    }
    let mut args = Vec::with_capacity(node.inputs.len());
    for src in &node.inputs {
        let producer = graph.node(src.node)?;
        let data = constant_of(graph, src.node)?;
        if producer.rt.keep_precision {
            return None;
        }
        let mut value = evaluate_op(src.node, &OpKind::Constant(data.clone()), &[]).ok()?;
        args.push(value.pop()?);
    }
    match evaluate_op(id, &node.op, &args) {
        Ok(mut out) if out.len() == 1 => out.pop(),
        Ok(_) => None,
        Err(err) => {
            trace!(node = %node, %err, "not folded");
            None
        }
    }
}

fn fold_node(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(value) = fold_value(graph, id) else {
        return Ok(false);
    };
    let Some(node) = graph.node(id) else {
        return Ok(false);
    };
    let declared = node.outputs.first().and_then(|d| d.shape.to_static().map(|s| (d.element_type, s)));
    if declared != Some((value.element_type, value.shape.clone())) {
        return Ok(false);
    }
    let name = node.name.clone();
    let rt = node.rt.clone();
    let constant = graph.add_constant(name, value.element_type, &value.shape, value.values)?;
    if let Some(folded) = graph.node_mut(constant) {
        folded.rt.keep_precision = rt.keep_precision;
        folded.rt.shape_subgraph = rt.shape_subgraph;
    }
    graph.replace_node(id, constant)?;
    Ok(true)
}

/// Replaces nodes computable at compile time with constants.
///
/// Dequantization and decompression chains are left alone so later passes
/// still see them. Nodes the evaluator cannot compute are skipped.
pub fn constant_folding() -> Pass {
    Pass::from_fn(CONSTANT_FOLDING, |graph, scope| {
        let candidates = scope.candidates(graph, is_fold_target)?;
        let mut folded = 0usize;
        for id in candidates {
            if fold_node(graph, id)? {
                folded += 1;
            }
        }
        if folded > 0 {
            let removed = graph.remove_dead_nodes();
            debug!(folded, removed, "constant folding");
        }
        Ok(folded > 0)
    })
}

// ── Identity converts ────────────────────────────────────────────────

/// Removes converts whose input already has the destination type.
pub fn eliminate_convert() -> Pass {
    Pass::from_fn(ELIMINATE_CONVERT, |graph, scope| {
        let candidates = scope.candidates(graph, |v| match v.op() {
            OpKind::Convert { destination } => {
                v.input_desc(0).is_some_and(|d| d.element_type == *destination)
            }
            _ => false,
        })?;
        let mut removed = 0usize;
        for id in candidates {
            let Some(src) = input_of(graph, id, 0) else {
                continue;
            };
            graph.replace_output_uses(id.into(), src)?;
            graph.remove_node(id)?;
            removed += 1;
        }
        Ok(removed > 0)
    })
}

// ── Transpose into MatMul ────────────────────────────────────────────

/// `order` swaps the last two axes and keeps every other one in place.
fn swaps_last_two(order: &[usize]) -> bool {
    let n = order.len();
    n >= 2
        && order[..n - 2].iter().enumerate().all(|(i, &axis)| i == axis)
        && order[n - 2] == n - 1
        && order[n - 1] == n - 2
}

/// Folds a last-two-axes `Transpose` on either MatMul input into the
/// MatMul's transpose flags.
pub fn transpose_matmul() -> Pass {
    Pass::from_fn(TRANSPOSE_MATMUL, |graph, scope| {
        let candidates = scope.candidates(graph, |v| v.op().is_matmul())?;
        let mut fused = 0usize;
        for mm in candidates {
            for port in 0..2 {
                let Some(src) = input_of(graph, mm, port) else {
                    continue;
                };
                let is_swap = graph
                    .node(src.node)
                    .is_some_and(|n| matches!(&n.op, OpKind::Transpose { order } if swaps_last_two(order)));
                if !is_swap {
                    continue;
                }
                let Some(inner) = input_of(graph, src.node, 0) else {
                    continue;
                };
                if let Some(OpKind::MatMul { transpose_a, transpose_b }) =
                    graph.node_mut(mm).map(|n| &mut n.op)
                {
                    let flag = if port == 0 { transpose_a } else { transpose_b };
                    *flag = !*flag;
                }
                graph.set_input(InputRef::new(mm, port), inner)?;
                graph.refresh(mm)?;
                fused += 1;
            }
        }
        if fused > 0 {
            graph.remove_dead_nodes();
        }
        Ok(fused > 0)
    })
}
