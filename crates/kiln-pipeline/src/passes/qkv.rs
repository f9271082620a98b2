//! Fusing the query/key/value projections that share one activation.

use super::{input_of, name_of};
use crate::pass::Pass;
use kiln_graph::{Graph, NodeId, OpKind, OutputRef};
use kiln_patterns::qkv_projection_candidates;
use tracing::debug;

pub const QKV_PROJECTION_FUSION: &str = "QkvProjectionFusion";

fn fuse(graph: &mut Graph, activation: NodeId, matmuls: &[NodeId]) -> kiln_graph::Result<()> {
    let mut inputs: Vec<OutputRef> = vec![activation.into()];
    for mm in matmuls {
        match input_of(graph, *mm, 1) {
            Some(weights) => inputs.push(weights),
            None => return Ok(()),
        }
    }
    let name = format!("{}/qkv", name_of(graph, activation));
    let fused = graph.add_node(name, OpKind::QkvProjection, inputs)?;
    for (port, mm) in matmuls.iter().enumerate() {
        graph.replace_output_uses((*mm).into(), OutputRef::new(fused, port))?;
        graph.remove_node(*mm)?;
    }
    Ok(())
}

/// Replaces three or more `MatMul(x, Wᵢᵀ)` sharing `x` with one
/// multi-output projection.
pub fn qkv_projection_fusion() -> Pass {
    Pass::from_fn(QKV_PROJECTION_FUSION, |graph, scope| {
        let candidates = scope.candidates(graph, |v| qkv_projection_candidates(v).is_some())?;
        let mut fused = 0usize;
        for activation in candidates {
            let Some(view) = kiln_graph::NodeView::new(graph, activation) else {
                continue;
            };
            let Some(matmuls) = qkv_projection_candidates(&view) else {
                continue;
            };
            fuse(graph, activation, &matmuls)?;
            fused += 1;
        }
        if fused > 0 {
            debug!(fused, "fused qkv projections");
        }
        Ok(fused > 0)
    })
}
