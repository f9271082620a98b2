//! Kernel-fusion tokenization: grouping nodes into regions the backend
//! compiles into one fused kernel.
//!
//! Regions are recorded as `fusion_group` ids in each node's runtime info.
//! Nodes marked `skip_fusion` are left to the MatMul post-op fuser instead.

use crate::pass::Pass;
use kiln_graph::{Graph, NodeId, NodeView, OutputRef};
use kiln_patterns::{is_matmul_post_op, is_tokenizable_kind, match_mha};
use std::collections::BTreeSet;
use tracing::{debug, trace};

pub const SNIPPETS_MARK_SKIPPED: &str = "SnippetsMarkSkipped";
pub const TOKENIZE_MHA: &str = "TokenizeMha";
pub const TOKENIZE_SNIPPETS: &str = "TokenizeSnippets";

fn next_group(graph: &Graph) -> u32 {
    graph.nodes().filter_map(|n| n.rt.fusion_group).max().map_or(0, |g| g + 1)
}

fn group_members(graph: &Graph, group: u32) -> BTreeSet<NodeId> {
    graph.nodes().filter(|n| n.rt.fusion_group == Some(group)).map(|n| n.id).collect()
}

// ── Skip marking ─────────────────────────────────────────────────────

/// Flags elementwise chains hanging off a MatMul so the tokenizer leaves
/// them to the MatMul post-op fuser.
pub fn snippets_mark_skipped() -> Pass {
    Pass::from_fn(SNIPPETS_MARK_SKIPPED, |graph, scope| {
        let mut marked = 0usize;
        for id in graph.topological_order()? {
            let post_op = NodeView::new(graph, id).is_some_and(|v| is_matmul_post_op(&v));
            if !post_op || !scope.admits(graph, id) {
                continue;
            }
            if let Some(node) = graph.node_mut(id)
                && !std::mem::replace(&mut node.rt.skip_fusion, true)
            {
                marked += 1;
            }
        }
        Ok(marked > 0)
    })
}

// ── Attention regions ────────────────────────────────────────────────

/// Groups every matched `MatMul -> ... -> Softmax -> ... -> MatMul` block.
pub fn tokenize_mha() -> Pass {
    Pass::from_fn(TOKENIZE_MHA, |graph, scope| {
        let candidates = scope.candidates(graph, |v| v.node().rt.fusion_group.is_none() && match_mha(v).is_some())?;
        let mut regions = 0usize;
        for first in candidates {
            let Some(region) = NodeView::new(graph, first).and_then(|v| match_mha(&v)) else {
                continue;
            };
            let nodes = region.nodes();
            let taken = nodes.iter().any(|id| graph.node(*id).is_none_or(|n| n.rt.fusion_group.is_some()));
            if taken {
                continue;
            }
            let group = next_group(graph);
            for id in nodes {
                if let Some(node) = graph.node_mut(id) {
                    node.rt.fusion_group = Some(group);
                }
            }
            regions += 1;
        }
        if regions > 0 {
            debug!(regions, "tokenized attention blocks");
        }
        Ok(regions > 0)
    })
}

// ── Generic regions ──────────────────────────────────────────────────

/// Inputs and outputs a region with `members` exchanges with the rest of
/// the graph. Single-element constants are inlined and do not count.
fn io_count(graph: &Graph, members: &BTreeSet<NodeId>) -> usize {
    let mut inputs: BTreeSet<OutputRef> = BTreeSet::new();
    let mut outputs: BTreeSet<OutputRef> = BTreeSet::new();
    for id in members {
        let Some(node) = graph.node(*id) else {
            continue;
        };
        for src in &node.inputs {
            if members.contains(&src.node) {
                continue;
            }
            let inlined = graph.node(src.node).is_some_and(|p| {
                p.op.is_constant() && p.outputs.first().and_then(|d| d.shape.element_count()) == Some(1)
            });
            if !inlined {
                inputs.insert(*src);
            }
        }
        for port in 0..node.outputs.len() {
            let out = OutputRef::new(*id, port);
            if graph.consumers(out).iter().any(|c| !members.contains(&c.node)) {
                outputs.insert(out);
            }
        }
    }
    inputs.len() + outputs.len()
}

/// Whether some input of `id` from outside `members` is computed from a
/// member, so merging would make the region feed itself.
fn creates_cycle(graph: &Graph, members: &BTreeSet<NodeId>, id: NodeId) -> bool {
    let Some(node) = graph.node(id) else {
        return false;
    };
    let mut stack: Vec<NodeId> =
        node.inputs.iter().map(|src| src.node).filter(|p| !members.contains(p)).collect();
    let mut seen = BTreeSet::new();
    while let Some(cur) = stack.pop() {
        if !seen.insert(cur) {
            continue;
        }
        let Some(n) = graph.node(cur) else {
            continue;
        };
        for src in &n.inputs {
            if members.contains(&src.node) {
                return true;
            }
            stack.push(src.node);
        }
    }
    false
}

/// Greedy region growing in topological order.
///
/// A node joins the first producer region that stays within `max_io`
/// external tensors and would not form a cycle; otherwise it opens a new
/// region. Regions opened by other passes are never extended.
pub fn tokenize_snippets(max_io: usize) -> Pass {
    Pass::from_fn(TOKENIZE_SNIPPETS, move |graph, scope| {
        let mut own: BTreeSet<u32> = BTreeSet::new();
        let mut next = next_group(graph);
        for id in graph.topological_order()? {
            let eligible = NodeView::new(graph, id).is_some_and(|v| {
                let rt = &v.node().rt;
                is_tokenizable_kind(v.op()) && !rt.skip_fusion && rt.fusion_group.is_none()
            });
            if !eligible || !scope.admits(graph, id) {
                continue;
            }
            let producer_groups: Vec<u32> = graph
                .node(id)
                .map(|n| {
                    n.inputs
                        .iter()
                        .filter_map(|src| graph.node(src.node).and_then(|p| p.rt.fusion_group))
                        .filter(|g| own.contains(g))
                        .collect()
                })
                .unwrap_or_default();

            let mut joined = None;
            for group in producer_groups {
                let mut members = group_members(graph, group);
                if creates_cycle(graph, &members, id) {
                    continue;
                }
                members.insert(id);
                if io_count(graph, &members) <= max_io {
                    joined = Some(group);
                    break;
                }
                trace!(node = %id, group, "region would exceed data pointer budget");
            }
            let group = joined.unwrap_or_else(|| {
                let fresh = next;
                next += 1;
                own.insert(fresh);
                fresh
            });
            if let Some(node) = graph.node_mut(id) {
                node.rt.fusion_group = Some(group);
            }
        }
        if !own.is_empty() {
            debug!(regions = own.len(), "tokenized fused regions");
        }
        Ok(!own.is_empty())
    })
}
