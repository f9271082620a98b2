//! Reference evaluator.
//!
//! Computes node outputs in `f64` and rounds every stored value through its
//! element type, so casts behave like the target: floats lose precision and
//! integer casts truncate toward zero and wrap.

use crate::graph::Graph;
use crate::node::{ConstantData, NodeId, OpKind, OutputRef};
use crate::shape::normalize_axis;
use kiln_common::ElementType;
use std::collections::BTreeMap;

/// A dense tensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Tensor {
    pub fn new(element_type: ElementType, shape: Vec<usize>, values: Vec<f64>) -> Self {
        let values = values.into_iter().map(|v| cast_value(v, element_type)).collect();
        Self { element_type, shape, values }
    }

    pub fn scalar(element_type: ElementType, value: f64) -> Self {
        Self::new(element_type, Vec::new(), vec![value])
    }

    fn from_constant(data: &ConstantData) -> Self {
        let count = data.element_count();
        let values = (0..count).map(|i| data.value(i).unwrap_or(0.0)).collect();
        Self::new(data.element_type, data.shape.clone(), values)
    }

    fn cast(&self, to: ElementType) -> Self {
        Self::new(to, self.shape.clone(), self.values.clone())
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self::new(self.element_type, self.shape.clone(), self.values.iter().map(|&v| f(v)).collect())
    }

    /// Truthiness of each value, as a byte-backed boolean reads it.
    pub fn as_bools(&self) -> Vec<bool> {
        self.values.iter().map(|&v| v != 0.0).collect()
    }
}

/// Evaluation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("no value bound for parameter {0}")]
    MissingInput(NodeId),
    #[error("cannot evaluate {op} node {node}")]
    Unsupported { node: NodeId, op: &'static str },
    #[error("node {node}: {reason}")]
    Invalid { node: NodeId, reason: String },
    #[error(transparent)]
    Graph(#[from] crate::error::GraphError),
}

/// Round `value` through `to` the way a conversion to that type would.
pub fn cast_value(value: f64, to: ElementType) -> f64 {
    match to {
        ElementType::F64 => value,
        ElementType::F32 => f64::from(value as f32),
        ElementType::F16 => half::f16::from_f64(value).to_f64(),
        ElementType::Bf16 => half::bf16::from_f64(value).to_f64(),
        ElementType::Boolean => f64::from(u8::from(value != 0.0)),
        ElementType::Nf4 => value.clamp(-1.0, 1.0),
        _ => wrap_integer(value, to),
    }
}

fn wrap_integer(value: f64, to: ElementType) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let modulus = 1i128 << to.bitwidth();
    let mut wrapped = (value.trunc() as i128).rem_euclid(modulus);
    if to.is_signed() && wrapped >= modulus / 2 {
        wrapped -= modulus;
    }
    wrapped as f64
}

/// Evaluate every result of `graph` given values for its parameters.
pub fn evaluate(
    graph: &Graph,
    inputs: &BTreeMap<NodeId, Tensor>,
) -> Result<Vec<Tensor>, EvalError> {
    let mut values: BTreeMap<OutputRef, Tensor> = BTreeMap::new();
    for id in graph.topological_order()? {
        let node = graph.node(id).ok_or(crate::error::GraphError::NodeNotFound(id))?;
        let outputs = if let OpKind::Parameter { element_type, .. } = node.op {
            let bound = inputs.get(&id).ok_or(EvalError::MissingInput(id))?;
            vec![bound.cast(element_type)]
        } else {
            let args = node
                .inputs
                .iter()
                .map(|src| {
                    values.get(src).cloned().ok_or(EvalError::Invalid {
                        node: id,
                        reason: format!("input {src} was not computed"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            evaluate_op(id, &node.op, &args)?
        };
        for (port, value) in outputs.into_iter().enumerate() {
            values.insert(OutputRef::new(id, port), value);
        }
    }
    graph
        .results()
        .iter()
        .map(|id| {
            values.remove(&OutputRef::new(*id, 0)).ok_or(EvalError::Invalid {
                node: *id,
                reason: "result was not computed".into(),
            })
        })
        .collect()
}

/// Evaluate one operation on concrete inputs.
pub fn evaluate_op(node: NodeId, op: &OpKind, args: &[Tensor]) -> Result<Vec<Tensor>, EvalError> {
    let arg = |i: usize| {
        args.get(i)
            .ok_or_else(|| EvalError::Invalid { node, reason: format!("missing input {i}") })
    };
    let out = match op {
        OpKind::Constant(data) => Tensor::from_constant(data),
        OpKind::Result | OpKind::ReadValue { .. } | OpKind::Assign { .. } => arg(0)?.clone(),
        OpKind::Convert { destination } => arg(0)?.cast(*destination),
        OpKind::Abs => arg(0)?.map(f64::abs),
        OpKind::Ceiling => arg(0)?.map(f64::ceil),
        OpKind::Floor => arg(0)?.map(f64::floor),
        OpKind::Round => arg(0)?.map(f64::round_ties_even),
        OpKind::Exp => arg(0)?.map(f64::exp),
        OpKind::Sqrt => arg(0)?.map(f64::sqrt),
        OpKind::Negative => arg(0)?.map(|v| -v),
        OpKind::Relu => arg(0)?.map(|v| v.max(0.0)),
        OpKind::Sigmoid => arg(0)?.map(sigmoid),
        OpKind::Tanh => arg(0)?.map(f64::tanh),
        OpKind::Gelu => arg(0)?.map(|v| {
            0.5 * v * (1.0 + ((2.0 / std::f64::consts::PI).sqrt() * (v + 0.044_715 * v.powi(3))).tanh())
        }),
        OpKind::Mish => arg(0)?.map(|v| v * v.exp().ln_1p().tanh()),
        OpKind::Swish => {
            let beta = args.get(1).map_or(1.0, |b| b.values.first().copied().unwrap_or(1.0));
            arg(0)?.map(|v| v * sigmoid(beta * v))
        }
        OpKind::Clamp { min, max } => arg(0)?.map(|v| v.clamp(*min, *max)),
        OpKind::HardSigmoid { alpha, beta } => {
            arg(0)?.map(|v| (alpha * v + beta).clamp(0.0, 1.0))
        }
        OpKind::Add => binary(node, arg(0)?, arg(1)?, |a, b| a + b)?,
        OpKind::Subtract => binary(node, arg(0)?, arg(1)?, |a, b| a - b)?,
        OpKind::Multiply => binary(node, arg(0)?, arg(1)?, |a, b| a * b)?,
        OpKind::Divide => {
            let integral = arg(0)?.element_type.is_integral();
            binary(node, arg(0)?, arg(1)?, |a, b| if integral { (a / b).trunc() } else { a / b })?
        }
        OpKind::Minimum => binary(node, arg(0)?, arg(1)?, f64::min)?,
        OpKind::Maximum => binary(node, arg(0)?, arg(1)?, f64::max)?,
        OpKind::Power => binary(node, arg(0)?, arg(1)?, f64::powf)?,
        OpKind::Reshape { target } => {
            let input = arg(0)?;
            let shape = resolve_reshape(node, &input.shape, target)?;
            Tensor { shape, ..input.clone() }
        }
        OpKind::Transpose { order } => transpose(node, arg(0)?, order)?,
        OpKind::Broadcast { target } => {
            let input = arg(0)?;
            let zeros = Tensor::new(input.element_type, target.clone(), vec![0.0; target.iter().product()]);
            binary(node, input, &zeros, |a, _| a)?
        }
        OpKind::ReduceMax { axes, keep_dims } => {
            reduce(node, arg(0)?, axes, *keep_dims, f64::NEG_INFINITY, f64::max)?
        }
        OpKind::ReduceSum { axes, keep_dims } => {
            reduce(node, arg(0)?, axes, *keep_dims, 0.0, |a, b| a + b)?
        }
        OpKind::Softmax { axis } => {
            let input = arg(0)?;
            let max = reduce(node, input, &[*axis], true, f64::NEG_INFINITY, f64::max)?;
            let shifted = binary(node, input, &max, |a, b| (a - b).exp())?;
            let sum = reduce(node, &shifted, &[*axis], true, 0.0, |a, b| a + b)?;
            binary(node, &shifted, &sum, |a, b| a / b)?
        }
        OpKind::Mvn { axes, eps } => {
            let input = arg(0)?;
            let count = reduced_count(node, &input.shape, axes)?;
            let sum = reduce(node, input, axes, true, 0.0, |a, b| a + b)?;
            let mean = sum.map(|v| v / count);
            let centered = binary(node, input, &mean, |a, b| a - b)?;
            let squares = centered.map(|v| v * v);
            let var = reduce(node, &squares, axes, true, 0.0, |a, b| a + b)?.map(|v| v / count);
            binary(node, &centered, &var, |a, b| a / (b + eps).sqrt())?
        }
        OpKind::MatMul { transpose_a, transpose_b } => {
            matmul(node, arg(0)?, arg(1)?, *transpose_a, *transpose_b)?
        }
        OpKind::FakeQuantize { levels } => fake_quantize(node, args, *levels)?,
        OpKind::ShapeOf { output_type } => {
            let input = arg(0)?;
            let dims = input.shape.iter().map(|&d| d as f64).collect();
            Tensor::new(*output_type, vec![input.shape.len()], dims)
        }
        OpKind::Parameter { .. }
        | OpKind::GroupNormalization { .. }
        | OpKind::ScaledDotProductAttention { .. }
        | OpKind::Gather { .. }
        | OpKind::PagedAttention
        | OpKind::QkvProjection => return Err(EvalError::Unsupported { node, op: op.name() }),
    };
    Ok(vec![out])
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut idx = vec![0; shape.len()];
    for i in (0..shape.len()).rev() {
        if shape[i] > 0 {
            idx[i] = flat % shape[i];
            flat /= shape[i];
        }
    }
    idx
}

fn broadcast_shape(node: NodeId, a: &[usize], b: &[usize]) -> Result<Vec<usize>, EvalError> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let x = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
            let y = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
            match (x, y) {
                (1, d) | (d, 1) => Ok(d),
                (p, q) if p == q => Ok(p),
                (p, q) => Err(EvalError::Invalid {
                    node,
                    reason: format!("cannot broadcast {a:?} with {b:?} ({p} vs {q})"),
                }),
            }
        })
        .collect()
}

/// Flat index into `shape` for an output index of higher or equal rank.
fn broadcast_index(out_idx: &[usize], shape: &[usize]) -> usize {
    let offset = out_idx.len() - shape.len();
    let strides = strides(shape);
    shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if d == 1 { 0 } else { out_idx[i + offset] * strides[i] })
        .sum()
}

fn binary(
    node: NodeId,
    a: &Tensor,
    b: &Tensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, EvalError> {
    let shape = broadcast_shape(node, &a.shape, &b.shape)?;
    let count: usize = shape.iter().product();
    let values = (0..count)
        .map(|flat| {
            let idx = unravel(flat, &shape);
            f(a.values[broadcast_index(&idx, &a.shape)], b.values[broadcast_index(&idx, &b.shape)])
        })
        .collect();
    Ok(Tensor::new(a.element_type, shape, values))
}

fn reduced_axes(node: NodeId, rank: usize, axes: &[i64]) -> Result<Vec<bool>, EvalError> {
    let mut reduced = vec![false; rank];
    for &axis in axes {
        let idx = normalize_axis(axis, rank).ok_or_else(|| EvalError::Invalid {
            node,
            reason: format!("axis {axis} out of range for rank {rank}"),
        })?;
        reduced[idx] = true;
    }
    Ok(reduced)
}

fn reduced_count(node: NodeId, shape: &[usize], axes: &[i64]) -> Result<f64, EvalError> {
    let reduced = reduced_axes(node, shape.len(), axes)?;
    Ok(shape.iter().zip(&reduced).filter(|(_, r)| **r).map(|(d, _)| *d as f64).product())
}

fn reduce(
    node: NodeId,
    input: &Tensor,
    axes: &[i64],
    keep_dims: bool,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, EvalError> {
    let reduced = reduced_axes(node, input.shape.len(), axes)?;
    let kept_shape: Vec<usize> =
        input.shape.iter().zip(&reduced).map(|(&d, &r)| if r { 1 } else { d }).collect();
    let kept_strides = strides(&kept_shape);
    let mut acc = vec![init; kept_shape.iter().product()];
    for (flat, &v) in input.values.iter().enumerate() {
        let idx = unravel(flat, &input.shape);
        let target: usize = idx
            .iter()
            .zip(&reduced)
            .zip(&kept_strides)
            .map(|((&i, &r), &s)| if r { 0 } else { i * s })
            .sum();
        acc[target] = f(acc[target], v);
    }
    let shape = if keep_dims {
        kept_shape
    } else {
        input.shape.iter().zip(&reduced).filter(|(_, r)| !**r).map(|(d, _)| *d).collect()
    };
    Ok(Tensor::new(input.element_type, shape, acc))
}

fn transpose(node: NodeId, input: &Tensor, order: &[usize]) -> Result<Tensor, EvalError> {
    if order.len() != input.shape.len() {
        return Err(EvalError::Invalid { node, reason: format!("bad transpose order {order:?}") });
    }
    let shape: Vec<usize> = order.iter().map(|&a| input.shape[a]).collect();
    let in_strides = strides(&input.shape);
    let values = (0..input.values.len())
        .map(|flat| {
            let out_idx = unravel(flat, &shape);
            let src: usize = order.iter().enumerate().map(|(i, &a)| out_idx[i] * in_strides[a]).sum();
            input.values[src]
        })
        .collect();
    Ok(Tensor::new(input.element_type, shape, values))
}

fn resolve_reshape(node: NodeId, input: &[usize], target: &[i64]) -> Result<Vec<usize>, EvalError> {
    let total: usize = input.iter().product();
    let mut dims: Vec<usize> = target
        .iter()
        .enumerate()
        .map(|(i, &t)| match t {
            0 => input.get(i).copied().unwrap_or(1),
            -1 => 1,
            d => d.max(1) as usize,
        })
        .collect();
    if let Some(wild) = target.iter().position(|&t| t == -1) {
        let known: usize = dims.iter().product();
        dims[wild] = total / known.max(1);
    }
    if dims.iter().product::<usize>() != total {
        return Err(EvalError::Invalid { node, reason: format!("cannot reshape {input:?} to {target:?}") });
    }
    Ok(dims)
}

fn matmul(
    node: NodeId,
    a: &Tensor,
    b: &Tensor,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<Tensor, EvalError> {
    let swap_last = |t: &Tensor| -> Result<Tensor, EvalError> {
        let rank = t.shape.len();
        let mut order: Vec<usize> = (0..rank).collect();
        order.swap(rank - 2, rank - 1);
        transpose(node, t, &order)
    };
    if a.shape.len() < 2 || b.shape.len() < 2 {
        return Err(EvalError::Invalid { node, reason: "matmul operands must be rank >= 2".into() });
    }
    let a = if transpose_a { swap_last(a)? } else { a.clone() };
    let b = if transpose_b { swap_last(b)? } else { b.clone() };
    let (m, k) = (a.shape[a.shape.len() - 2], a.shape[a.shape.len() - 1]);
    let (kb, n) = (b.shape[b.shape.len() - 2], b.shape[b.shape.len() - 1]);
    if k != kb {
        return Err(EvalError::Invalid { node, reason: format!("inner dimensions {k} vs {kb}") });
    }
    let batch_a = &a.shape[..a.shape.len() - 2];
    let batch_b = &b.shape[..b.shape.len() - 2];
    let batch = broadcast_shape(node, batch_a, batch_b)?;
    let batches: usize = batch.iter().product();
    let mut values = Vec::with_capacity(batches * m * n);
    for bi in 0..batches {
        let bidx = unravel(bi, &batch);
        let a_off = if batch_a.is_empty() { 0 } else { broadcast_index(&bidx, batch_a) } * m * k;
        let b_off = if batch_b.is_empty() { 0 } else { broadcast_index(&bidx, batch_b) } * k * n;
        for i in 0..m {
            for j in 0..n {
                let dot = (0..k).map(|p| a.values[a_off + i * k + p] * b.values[b_off + p * n + j]).sum();
                values.push(dot);
            }
        }
    }
    let mut shape = batch;
    shape.extend([m, n]);
    Ok(Tensor::new(a.element_type, shape, values))
}

fn fake_quantize(node: NodeId, args: &[Tensor], levels: u32) -> Result<Tensor, EvalError> {
    let [x, il, ih, ol, oh] = args else {
        return Err(EvalError::Invalid { node, reason: "FakeQuantize needs 5 inputs".into() });
    };
    let steps = f64::from(levels.saturating_sub(1).max(1));
    let shape = broadcast_shape(node, &x.shape, &il.shape)?;
    let count: usize = shape.iter().product();
    let values = (0..count)
        .map(|flat| {
            let idx = unravel(flat, &shape);
            let at = |t: &Tensor| t.values[broadcast_index(&idx, &t.shape)];
            let (v, lo, hi, olo, ohi) = (at(x), at(il), at(ih), at(ol), at(oh));
            if v <= lo.min(hi) {
                olo
            } else if v > lo.max(hi) {
                ohi
            } else {
                ((v - lo) / (hi - lo) * steps).round_ties_even() / steps * (ohi - olo) + olo
            }
        })
        .collect();
    Ok(Tensor::new(x.element_type, shape, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_casts_truncate_and_wrap() {
        assert_eq!(cast_value(0.01, ElementType::U8), 0.0);
        assert_eq!(cast_value(256.0, ElementType::U8), 0.0);
        assert_eq!(cast_value(-256.0, ElementType::U8), 0.0);
        assert_eq!(cast_value(-1.0, ElementType::U8), 255.0);
        assert_eq!(cast_value(200.0, ElementType::I8), -56.0);
        assert_eq!(cast_value(-3.7, ElementType::I32), -3.0);
    }

    #[test]
    fn boolean_cast_is_truthiness() {
        assert_eq!(cast_value(0.01, ElementType::Boolean), 1.0);
        assert_eq!(cast_value(0.0, ElementType::Boolean), 0.0);
    }

    #[test]
    fn half_rounding() {
        assert_eq!(cast_value(65520.0, ElementType::F16), f64::INFINITY);
        assert_eq!(cast_value(1.0 / 3.0, ElementType::F16), half::f16::from_f64(1.0 / 3.0).to_f64());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Tensor::new(ElementType::F64, vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let out = evaluate_op(NodeId(0), &OpKind::Softmax { axis: -1 }, &[x]).unwrap();
        let row0: f64 = out[0].values[..3].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-12);
        assert!((out[0].values[3] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn matmul_batched() {
        let a = Tensor::new(ElementType::F64, vec![2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::new(ElementType::F64, vec![2, 1], vec![10.0, 1.0]);
        let out = evaluate_op(NodeId(0), &OpKind::MatMul { transpose_a: false, transpose_b: false }, &[a, b])
            .unwrap();
        assert_eq!(out[0].shape, vec![2, 1, 1]);
        assert_eq!(out[0].values, vec![12.0, 34.0]);
    }

    #[test]
    fn transpose_reorders() {
        let x = Tensor::new(ElementType::F64, vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let out = evaluate_op(NodeId(0), &OpKind::Transpose { order: vec![1, 0] }, &[x]).unwrap();
        assert_eq!(out[0].shape, vec![3, 2]);
        assert_eq!(out[0].values, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn fake_quantize_snaps_to_levels() {
        let s = |v| Tensor::scalar(ElementType::F64, v);
        let x = Tensor::new(ElementType::F64, vec![4], vec![-1.0, 0.26, 0.74, 2.0]);
        let out = evaluate_op(
            NodeId(0),
            &OpKind::FakeQuantize { levels: 3 },
            &[x, s(0.0), s(1.0), s(0.0), s(1.0)],
        )
        .unwrap();
        assert_eq!(out[0].values, vec![0.0, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn integer_divide_truncates() {
        let a = Tensor::new(ElementType::I32, vec![2], vec![7.0, -7.0]);
        let b = Tensor::new(ElementType::I32, vec![1], vec![2.0]);
        let out = evaluate_op(NodeId(0), &OpKind::Divide, &[a, b]).unwrap();
        assert_eq!(out[0].values, vec![3.0, -3.0]);
    }
}
