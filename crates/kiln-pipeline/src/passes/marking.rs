//! Passes that only attach runtime flags for later passes.

use super::{input_of, output_type};
use crate::pass::Pass;
use kiln_graph::{ElementType, Graph, NodeId, OpKind, RuntimeInfo};
use std::collections::BTreeSet;
use tracing::debug;

pub const MARK_SHAPE_OF_SUBGRAPHS: &str = "MarkShapeOfSubgraphs";
pub const MARK_DEQUANTIZATION_SUBGRAPH: &str = "MarkDequantizationSubgraph";
pub const KEEP_CONST_AND_DECOMPRESSION: &str = "KeepConstAndDecompression";

/// Set one flag, reporting whether it was newly set.
fn set_flag(graph: &mut Graph, id: NodeId, flag: impl Fn(&mut RuntimeInfo) -> &mut bool) -> bool {
    let Some(node) = graph.node_mut(id) else {
        return false;
    };
    let slot = flag(&mut node.rt);
    !std::mem::replace(slot, true)
}

// ── Shape subgraphs ──────────────────────────────────────────────────

/// Flags every `ShapeOf` and the integral computation hanging off it.
pub fn mark_shape_of_subgraphs() -> Pass {
    Pass::from_fn(MARK_SHAPE_OF_SUBGRAPHS, |graph, scope| {
        let roots = scope.candidates(graph, |v| matches!(v.op(), OpKind::ShapeOf { .. }))?;
        let mut changed = false;
        let mut seen = BTreeSet::new();
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            changed |= set_flag(graph, id, |rt| &mut rt.shape_subgraph);
            let next: Vec<NodeId> = graph
                .all_consumers(id)
                .into_iter()
                .map(|i| i.node)
                .filter(|c| {
                    graph.node(*c).is_some_and(|n| {
                        !n.op.is_sink() && n.output_type().is_some_and(ElementType::is_integral)
                    })
                })
                .collect();
            stack.extend(next);
        }
        Ok(changed)
    })
}

// ── Dequantization chains ────────────────────────────────────────────

/// Nodes of one `Convert -> [Subtract] -> Multiply` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DequantizationChain {
    source: NodeId,
    convert: NodeId,
    subtract: Option<NodeId>,
    multiply: NodeId,
    /// Zero-point side of the subtract, possibly behind its own convert.
    zero_point: Vec<NodeId>,
}

fn match_dequantization(graph: &Graph, multiply: NodeId, precisions: &[ElementType]) -> Option<DequantizationChain> {
    let node = graph.node(multiply)?;
    if !matches!(node.op, OpKind::Multiply) {
        return None;
    }
    let mut cur = input_of(graph, multiply, 0)?.node;
    let mut subtract = None;
    let mut zero_point = Vec::new();
    if matches!(graph.node(cur)?.op, OpKind::Subtract) {
        subtract = Some(cur);
        let zp = input_of(graph, cur, 1)?.node;
        zero_point.push(zp);
        if graph.node(zp)?.op.is_convert()
            && let Some(inner) = input_of(graph, zp, 0)
        {
            zero_point.push(inner.node);
        }
        cur = input_of(graph, cur, 0)?.node;
    }
    if !graph.node(cur)?.op.is_convert() {
        return None;
    }
    let source = input_of(graph, cur, 0)?;
    let source_type = output_type(graph, source)?;
    precisions.contains(&source_type).then_some(DequantizationChain {
        source: source.node,
        convert: cur,
        subtract,
        multiply,
        zero_point,
    })
}

/// Marks `low-precision source -> Convert -> [Subtract] -> Multiply` chains.
///
/// The chain is flagged as dequantization (and decompression when
/// `decompression` is set); constant sources keep their precision.
/// An empty precision list makes the pass a no-op.
pub fn mark_dequantization_subgraph(precisions: Vec<ElementType>, decompression: bool) -> Pass {
    Pass::from_fn(MARK_DEQUANTIZATION_SUBGRAPH, move |graph, scope| {
        if precisions.is_empty() {
            return Ok(false);
        }
        let candidates = scope.candidates(graph, |v| matches!(v.op(), OpKind::Multiply))?;
        let mut changed = false;
        let mut marked = 0usize;
        for multiply in candidates {
            let Some(chain) = match_dequantization(graph, multiply, &precisions) else {
                continue;
            };
            let body = [Some(chain.convert), chain.subtract, Some(chain.multiply)];
            for id in body.into_iter().flatten() {
                changed |= set_flag(graph, id, |rt| &mut rt.dequantization);
                if decompression {
                    changed |= set_flag(graph, id, |rt| &mut rt.decompression);
                }
            }
            for id in std::iter::once(chain.source).chain(chain.zero_point) {
                if graph.node(id).is_some_and(|n| n.op.is_constant() || n.op.is_convert()) {
                    changed |= set_flag(graph, id, |rt| &mut rt.keep_precision);
                }
            }
            marked += 1;
        }
        if marked > 0 {
            debug!(marked, decompression, "marked dequantization chains");
        }
        Ok(changed)
    })
}

// ── Constant decompression ───────────────────────────────────────────

/// Keeps `Constant(low real) -> Convert(real)` weight decompression intact
/// so neither precision conversion nor folding touches it.
pub fn keep_const_and_decompression() -> Pass {
    Pass::from_fn(KEEP_CONST_AND_DECOMPRESSION, |graph, scope| {
        let candidates = scope.candidates(graph, |v| {
            let OpKind::Convert { destination } = *v.op() else {
                return false;
            };
            v.input(0).is_some_and(|src| {
                src.op().is_constant()
                    && src.output(0).is_some_and(|d| {
                        d.element_type.is_real() && d.element_type != destination
                    })
            }) && destination.is_real()
        })?;
        let mut changed = false;
        for convert in candidates {
            changed |= set_flag(graph, convert, |rt| &mut rt.keep_precision);
            changed |= set_flag(graph, convert, |rt| &mut rt.decompression);
            if let Some(src) = input_of(graph, convert, 0) {
                changed |= set_flag(graph, src.node, |rt| &mut rt.keep_precision);
            }
        }
        Ok(changed)
    })
}
