//! Graph-wide element-type conversion.
//!
//! [`convert_precision`] walks the graph once in topological order. Every
//! node that is not kept has its type attributes retagged through the
//! [`PrecisionMap`], its constant payload re-cast, and its outputs
//! re-inferred. Kept nodes keep their stored outputs; converts are spliced in
//! wherever a kept node meets a converted one.

use crate::fuse::{fuse_boolean_cast, fuse_fake_quantize, needs_boolean_rewrite};
use crate::precision_map::PrecisionMap;
use kiln_common::ElementType;
use kiln_graph::{
    Graph, GraphError, InputRef, NodeId, OpKind, OutputRef, Result, cast_value, infer_outputs,
};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};

/// Operations kept in their original precision when
/// [`ConvertOptions::keep_precision_sensitive`] is set.
pub const PRECISION_SENSITIVE_OPS: [&str; 5] =
    ["Mvn", "GroupNormalization", "Softmax", "Exp", "Power"];

// ── Options ──────────────────────────────────────────────────────────

/// Switches for the special-case rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Wrap FakeQuantize nodes in converts instead of retagging them.
    pub fuse_fake_quantize: bool,
    /// Rewrite real-to-boolean casts so they saturate.
    pub fuse_boolean_cast: bool,
    /// Keep shape sub-graphs and numerically sensitive operations.
    pub keep_precision_sensitive: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self { fuse_fake_quantize: false, fuse_boolean_cast: true, keep_precision_sensitive: false }
    }
}

impl ConvertOptions {
    #[must_use]
    pub const fn with_fuse_fake_quantize(mut self, on: bool) -> Self {
        self.fuse_fake_quantize = on;
        self
    }

    #[must_use]
    pub const fn with_fuse_boolean_cast(mut self, on: bool) -> Self {
        self.fuse_boolean_cast = on;
        self
    }

    #[must_use]
    pub const fn with_keep_precision_sensitive(mut self, on: bool) -> Self {
        self.keep_precision_sensitive = on;
        self
    }
}

// ── Statistics ───────────────────────────────────────────────────────

/// What one conversion run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionStats {
    /// Nodes whose output types changed.
    pub retagged: usize,
    /// Constants whose payload was re-cast.
    pub recast_constants: usize,
    /// Convert nodes spliced between kept and converted nodes.
    pub inserted_converts: usize,
    pub fused_fake_quantize: usize,
    pub fused_boolean_casts: usize,
}

impl ConversionStats {
    /// Whether the graph was modified.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.retagged > 0
            || self.recast_constants > 0
            || self.inserted_converts > 0
            || self.fused_fake_quantize > 0
            || self.fused_boolean_casts > 0
    }
}

impl fmt::Display for ConversionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retagged={} recast={} inserted={} fq={} bool={}",
            self.retagged,
            self.recast_constants,
            self.inserted_converts,
            self.fused_fake_quantize,
            self.fused_boolean_casts
        )
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Rewrite every element type of `graph` found as a key of `map`.
///
/// Types that are not keys survive unchanged. Running twice with the same
/// map inserts nothing the second time.
pub fn convert_precision(
    graph: &mut Graph,
    map: &PrecisionMap,
    opts: &ConvertOptions,
) -> Result<ConversionStats> {
    let mut stats = ConversionStats::default();
    if map.is_empty() {
        return Ok(stats);
    }

    let original: BTreeMap<OutputRef, ElementType> = graph
        .nodes()
        .flat_map(|n| {
            n.outputs.iter().enumerate().map(|(port, d)| (OutputRef::new(n.id, port), d.element_type))
        })
        .collect();

    for id in graph.topological_order()? {
        let Some(node) = graph.node(id) else {
            continue;
        };
        if is_kept(node, opts) {
            stats.inserted_converts += restore_kept_inputs(graph, id, &original)?;
            continue;
        }

        let before: Vec<ElementType> = node.outputs.iter().map(|d| d.element_type).collect();
        match convert_node(graph, id, map, opts, &original, &mut stats)? {
            Converted::Replaced(new) => {
                stats.fused_boolean_casts += 1;
                stats.retagged += 1;
                trace!(old = %id, new = %new, "boolean cast replaced");
            }
            Converted::InPlace => {
                graph.refresh(id)?;
                let after = graph.node(id).map(|n| n.outputs.iter().map(|d| d.element_type).collect());
                if after.as_ref() != Some(&before) {
                    stats.retagged += 1;
                }
            }
        }
    }

    debug!(graph = graph.name(), %map, %stats, "precision conversion finished");
    Ok(stats)
}

enum Converted {
    InPlace,
    Replaced(NodeId),
}

fn is_kept(node: &kiln_graph::Node, opts: &ConvertOptions) -> bool {
    node.rt.keep_precision
        || (opts.keep_precision_sensitive
            && (node.rt.shape_subgraph || PRECISION_SENSITIVE_OPS.contains(&node.op.name())))
}

/// Splice `Convert(original)` before each input of a kept node whose
/// producer changed type, when the change would alter the node's outputs.
fn restore_kept_inputs(
    graph: &mut Graph,
    id: NodeId,
    original: &BTreeMap<OutputRef, ElementType>,
) -> Result<usize> {
    let Some(node) = graph.node(id) else {
        return Ok(0);
    };
    let mut descs = Vec::with_capacity(node.inputs.len());
    for (port, src) in node.inputs.iter().enumerate() {
        let desc = graph.output_desc(*src).cloned().ok_or(GraphError::DanglingEdge {
            node: id,
            port,
            source_ref: *src,
        })?;
        descs.push(desc);
    }
    let unchanged = infer_outputs(&node.op, &descs).is_ok_and(|outs| outs == node.outputs);
    if unchanged {
        return Ok(0);
    }

    let name = node.name.clone();
    let changed: Vec<(usize, ElementType)> = node
        .inputs
        .iter()
        .zip(&descs)
        .enumerate()
        .filter_map(|(port, (src, desc))| {
            let was = original_type(graph, *src, original)?;
            (was != desc.element_type).then_some((port, was))
        })
        .collect();
    for (port, was) in &changed {
        let cvt = graph.insert_before(
            InputRef::new(id, *port),
            format!("{name}/restore{port}"),
            OpKind::Convert { destination: *was },
        )?;
        mark_kept(graph, cvt);
    }
    if !changed.is_empty() {
        trace!(node = %id, restored = changed.len(), "kept node inputs restored");
    }
    Ok(changed.len())
}

/// Type `src` carried before conversion started.
///
/// A producer added during the run has no entry; for an inserted `Convert`
/// the type is looked up through its input.
fn original_type(
    graph: &Graph,
    src: OutputRef,
    original: &BTreeMap<OutputRef, ElementType>,
) -> Option<ElementType> {
    if let Some(ty) = original.get(&src) {
        return Some(*ty);
    }
    let producer = graph.node(src.node)?;
    match producer.op {
        OpKind::Convert { .. } => {
            let input = *producer.inputs.first()?;
            original.get(&input).copied().or_else(|| graph.output_desc(input).map(|d| d.element_type))
        }
        _ => None,
    }
}

fn convert_node(
    graph: &mut Graph,
    id: NodeId,
    map: &PrecisionMap,
    opts: &ConvertOptions,
    original: &BTreeMap<OutputRef, ElementType>,
    stats: &mut ConversionStats,
) -> Result<Converted> {
    let Some(node) = graph.node(id) else {
        return Err(GraphError::NodeNotFound(id));
    };

    match node.op.clone() {
        OpKind::Parameter { element_type, shape } => {
            if let Some(to) = map.get(element_type) {
                set_op(graph, id, OpKind::Parameter { element_type: to, shape })?;
            }
        }
        OpKind::Constant(mut data) => {
            if let Some(to) = map.get(data.element_type) {
                for v in &mut data.values {
                    *v = cast_value(*v, to);
                }
                data.element_type = to;
                set_op(graph, id, OpKind::Constant(data))?;
                stats.recast_constants += 1;
            }
        }
        OpKind::ShapeOf { output_type } => {
            if let Some(to) = map.get(output_type) {
                set_op(graph, id, OpKind::ShapeOf { output_type: to })?;
            }
        }
        OpKind::Convert { destination } => {
            if let Some(to) = map.get(destination) {
                let input_type = node
                    .inputs
                    .first()
                    .and_then(|src| graph.output_desc(*src))
                    .map(|d| d.element_type)
                    .ok_or(GraphError::PortOutOfRange { node: id, port: 0 })?;
                if opts.fuse_boolean_cast && needs_boolean_rewrite(input_type, destination, to) {
                    let (new, added) = fuse_boolean_cast(graph, id, to, |t| map.get(t))?;
                    stats.inserted_converts += added;
                    return Ok(Converted::Replaced(new));
                }
                set_op(graph, id, OpKind::Convert { destination: to })?;
            }
            return Ok(Converted::InPlace);
        }
        OpKind::FakeQuantize { .. } if opts.fuse_fake_quantize => {
            let from = original.get(&OutputRef::new(id, 0)).copied();
            if let Some(from) = from
                && let Some(to) = map.get(from)
            {
                stats.inserted_converts +=
                    fuse_fake_quantize(graph, id, from, to, |consumer| is_kept(consumer, opts))?;
                stats.fused_fake_quantize += 1;
                return Ok(Converted::InPlace);
            }
        }
        OpKind::Result => return Ok(Converted::InPlace),
        _ => {}
    }

    stats.inserted_converts += convert_kept_inputs(graph, id, map)?;
    Ok(Converted::InPlace)
}

/// Splice `Convert(mapped)` before each input still carrying a mapped type.
///
/// Only producers that were kept can still carry one at this point.
fn convert_kept_inputs(graph: &mut Graph, id: NodeId, map: &PrecisionMap) -> Result<usize> {
    let Some(node) = graph.node(id) else {
        return Ok(0);
    };
    let name = node.name.clone();
    let pending: Vec<(usize, ElementType)> = node
        .inputs
        .iter()
        .enumerate()
        .filter_map(|(port, src)| {
            let ty = graph.output_desc(*src)?.element_type;
            map.get(ty).map(|to| (port, to))
        })
        .collect();
    for (port, to) in &pending {
        let cvt = graph.insert_before(
            InputRef::new(id, *port),
            format!("{name}/convert{port}"),
            OpKind::Convert { destination: *to },
        )?;
        mark_kept(graph, cvt);
    }
    Ok(pending.len())
}

fn set_op(graph: &mut Graph, id: NodeId, op: OpKind) -> Result<()> {
    let node = graph.node_mut(id).ok_or(GraphError::NodeNotFound(id))?;
    node.op = op;
    Ok(())
}

fn mark_kept(graph: &mut Graph, id: NodeId) {
    if let Some(node) = graph.node_mut(id) {
        node.rt.keep_precision = true;
    }
}
