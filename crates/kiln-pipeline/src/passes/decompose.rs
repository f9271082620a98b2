//! Decompositions of composite operations into primitives the backend
//! always runs.
//!
//! The node at the end of every decomposition takes over the original
//! friendly name.

use crate::pass::Pass;
use kiln_graph::{
    Dim, ElementType, Graph, NodeId, NodeView, OpKind, OutputRef, PartialShape, matmul_shape,
};
use tracing::debug;

pub const SOFTMAX_DECOMPOSITION: &str = "SoftmaxDecomposition";
pub const SDPA_DECOMPOSITION: &str = "ScaledDotProductAttentionDecomposition";
pub const GROUP_NORMALIZATION_DECOMPOSITION: &str = "GroupNormalizationDecomposition";
pub const HARD_SIGMOID_DECOMPOSITION: &str = "HardSigmoidDecomposition";
pub const DECOMPOSE_INTEGER_DIVIDE: &str = "DecomposeIntegerDivide";
pub const FAKE_QUANTIZE_DECOMPOSITION: &str = "FakeQuantizeDecomposition";

type Decompose = fn(&mut Graph, NodeId) -> kiln_graph::Result<bool>;

/// A pass applying `rewrite` to every admitted node matching `pattern`.
fn decomposition(name: &'static str, pattern: fn(&NodeView<'_>) -> bool, rewrite: Decompose) -> Pass {
    Pass::from_fn(name, move |graph, scope| {
        let mut count = 0usize;
        for id in scope.candidates(graph, pattern)? {
            if rewrite(graph, id)? {
                count += 1;
            }
        }
        if count > 0 {
            debug!(pass = name, count, "decomposed");
        }
        Ok(count > 0)
    })
}

fn scalar(graph: &mut Graph, name: String, ty: ElementType, value: f64) -> kiln_graph::Result<OutputRef> {
    graph.add_scalar(name, ty, value).map(OutputRef::from)
}

fn node_op(graph: &mut Graph, name: String, op: OpKind, inputs: Vec<OutputRef>) -> kiln_graph::Result<OutputRef> {
    graph.add_node(name, op, inputs).map(OutputRef::from)
}

/// Inputs and output type of `id` when its op matches.
fn parts(graph: &Graph, id: NodeId) -> Option<(String, Vec<OutputRef>, ElementType)> {
    let node = graph.node(id)?;
    Some((node.name.clone(), node.inputs.clone(), node.output_type()?))
}

// ── Softmax ──────────────────────────────────────────────────────────

fn decompose_softmax(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(OpKind::Softmax { axis }) = graph.node(id).map(|n| n.op.clone()) else {
        return Ok(false);
    };
    let Some((name, inputs, _)) = parts(graph, id) else {
        return Ok(false);
    };
    let x = inputs[0];
    let max = node_op(graph, format!("{name}/max"), OpKind::ReduceMax { axes: vec![axis], keep_dims: true }, vec![x])?;
    let shifted = node_op(graph, format!("{name}/sub"), OpKind::Subtract, vec![x, max])?;
    let exp = node_op(graph, format!("{name}/exp"), OpKind::Exp, vec![shifted])?;
    let sum = node_op(graph, format!("{name}/sum"), OpKind::ReduceSum { axes: vec![axis], keep_dims: true }, vec![exp])?;
    let out = graph.add_node(name, OpKind::Divide, vec![exp, sum])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn softmax_decomposition() -> Pass {
    decomposition(SOFTMAX_DECOMPOSITION, |v| matches!(v.op(), OpKind::Softmax { .. }), decompose_softmax)
}

// ── Scaled dot-product attention ─────────────────────────────────────

fn static_dim(graph: &Graph, src: OutputRef, axis: i64) -> Option<usize> {
    graph.output_desc(src)?.shape.dim(axis).and_then(Dim::as_static)
}

/// Additive bias of a causal mask: 0 where key `j` is visible to query `i`.
fn causal_bias(queries: usize, keys: usize, lowest: f64) -> Vec<f64> {
    let offset = keys as i64 - queries as i64;
    (0..queries as i64)
        .flat_map(|i| (0..keys as i64).map(move |j| if j <= i + offset { 0.0 } else { lowest }))
        .collect()
}

/// Bring `src` to `ty` with a convert when it differs.
fn cast_to(graph: &mut Graph, src: OutputRef, ty: ElementType, name: String) -> kiln_graph::Result<OutputRef> {
    match graph.output_desc(src).map(|d| d.element_type) {
        Some(current) if current != ty => node_op(graph, name, OpKind::Convert { destination: ty }, vec![src]),
        _ => Ok(src),
    }
}

/// `softmax(q·kᵀ·scale + mask)·v`.
///
/// Skipped when the head size is dynamic and no scale input is given, or a
/// causal mask is requested over dynamic sequence lengths.
fn decompose_sdpa(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(OpKind::ScaledDotProductAttention { causal }) = graph.node(id).map(|n| n.op.clone()) else {
        return Ok(false);
    };
    let Some((name, inputs, ty)) = parts(graph, id) else {
        return Ok(false);
    };
    let (q, k, v) = (inputs[0], inputs[1], inputs[2]);

    let declared = graph.node(id).and_then(|n| n.outputs.first()).map(|d| d.shape.clone());
    let expected = graph.output_desc(q).zip(graph.output_desc(k)).zip(graph.output_desc(v)).and_then(
        |((qd, kd), vd)| {
            let scores = matmul_shape(&qd.shape, &kd.shape, false, true).ok()?;
            matmul_shape(&scores, &vd.shape, false, false).ok()
        },
    );
    if expected.is_none() || expected != declared {
        return Ok(false);
    }
    let head_size = static_dim(graph, q, -1);
    if inputs.get(4).is_none() && !head_size.is_some_and(|d| d > 0) {
        return Ok(false);
    }
    let causal_dims = static_dim(graph, q, -2).zip(static_dim(graph, k, -2));
    if causal && causal_dims.is_none() {
        return Ok(false);
    }

    let scale = match (inputs.get(4), head_size) {
        (Some(s), _) => cast_to(graph, *s, ty, format!("{name}/scale_cvt"))?,
        (None, Some(d)) => scalar(graph, format!("{name}/scale"), ty, 1.0 / (d as f64).sqrt())?,
        (None, None) => return Ok(false),
    };

    let scores = node_op(graph, format!("{name}/qk"), OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![q, k])?;
    let mut logits = node_op(graph, format!("{name}/scaled"), OpKind::Multiply, vec![scores, scale])?;

    let bias = match (causal, causal_dims, inputs.get(3)) {
        (true, Some((queries, keys)), _) => {
            let values = causal_bias(queries, keys, ty.min_value());
            Some(graph.add_constant(format!("{name}/causal"), ty, &[queries, keys], values)?.into())
        }
        (false, _, Some(mask)) if graph.output_desc(*mask).is_some_and(|d| d.element_type == ElementType::Boolean) => {
            let m = node_op(graph, format!("{name}/mask_cvt"), OpKind::Convert { destination: ty }, vec![*mask])?;
            let one = scalar(graph, format!("{name}/one"), ty, 1.0)?;
            let hidden = node_op(graph, format!("{name}/mask_inv"), OpKind::Subtract, vec![one, m])?;
            let lowest = scalar(graph, format!("{name}/lowest"), ty, ty.min_value())?;
            Some(node_op(graph, format!("{name}/mask_bias"), OpKind::Multiply, vec![hidden, lowest])?)
        }
        (false, _, Some(mask)) => Some(cast_to(graph, *mask, ty, format!("{name}/mask_cvt"))?),
        _ => None,
    };
    if let Some(bias) = bias {
        logits = node_op(graph, format!("{name}/masked"), OpKind::Add, vec![logits, bias])?;
    }
    let probs = node_op(graph, format!("{name}/softmax"), OpKind::Softmax { axis: -1 }, vec![logits])?;
    let out = graph.add_node(name, OpKind::MatMul { transpose_a: false, transpose_b: false }, vec![probs, v])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn sdpa_decomposition() -> Pass {
    decomposition(
        SDPA_DECOMPOSITION,
        |v| matches!(v.op(), OpKind::ScaledDotProductAttention { .. }),
        decompose_sdpa,
    )
}

// ── Group normalization ──────────────────────────────────────────────

fn decompose_group_norm(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(OpKind::GroupNormalization { num_groups, eps }) = graph.node(id).map(|n| n.op.clone()) else {
        return Ok(false);
    };
    let Some((name, inputs, _)) = parts(graph, id) else {
        return Ok(false);
    };
    let (data, scale, bias) = (inputs[0], inputs[1], inputs[2]);
    let Some(shape) = graph.output_desc(data).and_then(|d| d.shape.to_static()) else {
        return Ok(false);
    };
    if shape.len() < 2 || shape.contains(&0) {
        return Ok(false);
    }
    let channels = shape[1];
    let per_channel_ok = [scale, bias].iter().all(|src| {
        graph.output_desc(*src).and_then(|d| d.shape.element_count()) == Some(channels)
    });
    if !per_channel_ok {
        return Ok(false);
    }

    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let mut per_channel = vec![channels as i64];
    per_channel.resize(shape.len() - 1, 1);

    let grouped = node_op(
        graph,
        format!("{name}/group"),
        OpKind::Reshape { target: vec![dims[0], num_groups as i64, -1] },
        vec![data],
    )?;
    let norm = node_op(graph, format!("{name}/mvn"), OpKind::Mvn { axes: vec![2], eps }, vec![grouped])?;
    let restored = node_op(graph, format!("{name}/restore"), OpKind::Reshape { target: dims }, vec![norm])?;
    let scale = node_op(graph, format!("{name}/scale"), OpKind::Reshape { target: per_channel.clone() }, vec![scale])?;
    let bias = node_op(graph, format!("{name}/bias"), OpKind::Reshape { target: per_channel }, vec![bias])?;
    let scaled = node_op(graph, format!("{name}/mul"), OpKind::Multiply, vec![restored, scale])?;
    let out = graph.add_node(name, OpKind::Add, vec![scaled, bias])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn group_normalization_decomposition() -> Pass {
    decomposition(
        GROUP_NORMALIZATION_DECOMPOSITION,
        |v| matches!(v.op(), OpKind::GroupNormalization { .. }),
        decompose_group_norm,
    )
}

// ── Hard sigmoid ─────────────────────────────────────────────────────

fn decompose_hard_sigmoid(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(OpKind::HardSigmoid { alpha, beta }) = graph.node(id).map(|n| n.op.clone()) else {
        return Ok(false);
    };
    let Some((name, inputs, ty)) = parts(graph, id) else {
        return Ok(false);
    };
    let alpha = scalar(graph, format!("{name}/alpha"), ty, alpha)?;
    let beta = scalar(graph, format!("{name}/beta"), ty, beta)?;
    let mul = node_op(graph, format!("{name}/mul"), OpKind::Multiply, vec![inputs[0], alpha])?;
    let add = node_op(graph, format!("{name}/add"), OpKind::Add, vec![mul, beta])?;
    let out = graph.add_node(name, OpKind::Clamp { min: 0.0, max: 1.0 }, vec![add])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn hard_sigmoid_decomposition() -> Pass {
    decomposition(
        HARD_SIGMOID_DECOMPOSITION,
        |v| matches!(v.op(), OpKind::HardSigmoid { .. }),
        decompose_hard_sigmoid,
    )
}

// ── Integer divide ───────────────────────────────────────────────────

/// Integer division through f32, truncating back on the final convert.
fn decompose_integer_divide(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some((name, inputs, ty)) = parts(graph, id) else {
        return Ok(false);
    };
    let to_f32 = OpKind::Convert { destination: ElementType::F32 };
    let a = node_op(graph, format!("{name}/a"), to_f32.clone(), vec![inputs[0]])?;
    let b = node_op(graph, format!("{name}/b"), to_f32, vec![inputs[1]])?;
    let div = node_op(graph, format!("{name}/div"), OpKind::Divide, vec![a, b])?;
    let out = graph.add_node(name, OpKind::Convert { destination: ty }, vec![div])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn decompose_integer_divide_pass() -> Pass {
    decomposition(
        DECOMPOSE_INTEGER_DIVIDE,
        |v| {
            matches!(v.op(), OpKind::Divide)
                && v.output(0).is_some_and(|d| d.element_type.is_integral())
        },
        decompose_integer_divide,
    )
}

// ── Fake quantize ────────────────────────────────────────────────────

/// Clamp, normalise, round to `levels - 1` steps and rescale to the
/// output range.
fn decompose_fake_quantize(graph: &mut Graph, id: NodeId) -> kiln_graph::Result<bool> {
    let Some(OpKind::FakeQuantize { levels }) = graph.node(id).map(|n| n.op.clone()) else {
        return Ok(false);
    };
    let Some((name, inputs, ty)) = parts(graph, id) else {
        return Ok(false);
    };
    let Some(data_shape) = graph.output_desc(inputs[0]).map(|d| d.shape.clone()) else {
        return Ok(false);
    };
    let ranges_broadcast = inputs[1..].iter().all(|src| {
        graph
            .output_desc(*src)
            .and_then(|d| PartialShape::broadcast(&data_shape, &d.shape).ok())
            .is_some_and(|s| s == data_shape)
    });
    if !ranges_broadcast {
        return Ok(false);
    }
    let (x, in_lo, in_hi, out_lo, out_hi) = (inputs[0], inputs[1], inputs[2], inputs[3], inputs[4]);
    let steps = scalar(graph, format!("{name}/steps"), ty, f64::from(levels.saturating_sub(1).max(1)))?;

    let above = node_op(graph, format!("{name}/max"), OpKind::Maximum, vec![x, in_lo])?;
    let clamped = node_op(graph, format!("{name}/min"), OpKind::Minimum, vec![above, in_hi])?;
    let shifted = node_op(graph, format!("{name}/shift"), OpKind::Subtract, vec![clamped, in_lo])?;
    let in_range = node_op(graph, format!("{name}/in_range"), OpKind::Subtract, vec![in_hi, in_lo])?;
    let unit = node_op(graph, format!("{name}/norm"), OpKind::Divide, vec![shifted, in_range])?;
    let scaled = node_op(graph, format!("{name}/scale"), OpKind::Multiply, vec![unit, steps])?;
    let rounded = node_op(graph, format!("{name}/round"), OpKind::Round, vec![scaled])?;
    let quant = node_op(graph, format!("{name}/unscale"), OpKind::Divide, vec![rounded, steps])?;
    let out_range = node_op(graph, format!("{name}/out_range"), OpKind::Subtract, vec![out_hi, out_lo])?;
    let ranged = node_op(graph, format!("{name}/range"), OpKind::Multiply, vec![quant, out_range])?;
    let out = graph.add_node(name, OpKind::Add, vec![ranged, out_lo])?;
    graph.replace_node(id, out)?;
    Ok(true)
}

pub fn fake_quantize_decomposition() -> Pass {
    decomposition(
        FAKE_QUANTIZE_DECOMPOSITION,
        |v| matches!(v.op(), OpKind::FakeQuantize { .. }),
        decompose_fake_quantize,
    )
}
