//! Output type and shape inference.
//!
//! Every node's outputs are a pure function of its attributes and its input
//! descriptors. Validation recomputes them and compares against what the
//! graph stores.

use crate::node::{OpKind, TensorDesc};
use crate::shape::{Dim, PartialShape, normalize_axis};
use kiln_common::ElementType;

/// Compute the output descriptors of `op` applied to `inputs`.
///
/// Errors are human-readable reasons; callers attach the node identity.
pub fn infer_outputs(op: &OpKind, inputs: &[TensorDesc]) -> Result<Vec<TensorDesc>, String> {
    match op {
        OpKind::Parameter { element_type, shape } => {
            expect_arity(op, inputs, 0, 0)?;
            Ok(vec![TensorDesc::new(*element_type, shape.clone())])
        }
        OpKind::Constant(data) => {
            expect_arity(op, inputs, 0, 0)?;
            Ok(vec![TensorDesc::new(data.element_type, PartialShape::from_static(&data.shape))])
        }
        OpKind::Result | OpKind::ReadValue { .. } | OpKind::Assign { .. } => {
            expect_arity(op, inputs, 1, 1)?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Convert { destination } => {
            expect_arity(op, inputs, 1, 1)?;
            Ok(vec![TensorDesc::new(*destination, inputs[0].shape.clone())])
        }
        OpKind::Swish => {
            expect_arity(op, inputs, 1, 2)?;
            expect_real(op, &inputs[0])?;
            if let Some(beta) = inputs.get(1) {
                expect_same_type(op, &inputs[0], beta)?;
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Exp
        | OpKind::Sqrt
        | OpKind::Sigmoid
        | OpKind::Tanh
        | OpKind::Gelu
        | OpKind::Mish
        | OpKind::HardSigmoid { .. } => {
            expect_arity(op, inputs, 1, 1)?;
            expect_real(op, &inputs[0])?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Clamp { min, max } => {
            expect_arity(op, inputs, 1, 1)?;
            expect_numeric(op, &inputs[0])?;
            if min > max {
                return Err(format!("Clamp min {min} exceeds max {max}"));
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Abs
        | OpKind::Ceiling
        | OpKind::Floor
        | OpKind::Round
        | OpKind::Negative
        | OpKind::Relu => {
            expect_arity(op, inputs, 1, 1)?;
            expect_numeric(op, &inputs[0])?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Add
        | OpKind::Subtract
        | OpKind::Multiply
        | OpKind::Divide
        | OpKind::Minimum
        | OpKind::Maximum
        | OpKind::Power => {
            expect_arity(op, inputs, 2, 2)?;
            expect_same_type(op, &inputs[0], &inputs[1])?;
            let shape = PartialShape::broadcast(&inputs[0].shape, &inputs[1].shape)?;
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::MatMul { transpose_a, transpose_b } => {
            expect_arity(op, inputs, 2, 2)?;
            expect_same_type(op, &inputs[0], &inputs[1])?;
            let shape =
                matmul_shape(&inputs[0].shape, &inputs[1].shape, *transpose_a, *transpose_b)?;
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::Reshape { target } => {
            expect_arity(op, inputs, 1, 1)?;
            let shape = reshape_shape(&inputs[0].shape, target)?;
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::Transpose { order } => {
            expect_arity(op, inputs, 1, 1)?;
            let shape = transpose_shape(&inputs[0].shape, order)?;
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::Broadcast { target } => {
            expect_arity(op, inputs, 1, 1)?;
            let target_shape = PartialShape::from_static(target);
            let shape = PartialShape::broadcast(&inputs[0].shape, &target_shape)?;
            if shape != target_shape {
                return Err(format!("cannot broadcast {} to {target_shape}", inputs[0].shape));
            }
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::ReduceMax { axes, keep_dims } | OpKind::ReduceSum { axes, keep_dims } => {
            expect_arity(op, inputs, 1, 1)?;
            expect_numeric(op, &inputs[0])?;
            let shape = reduce_shape(&inputs[0].shape, axes, *keep_dims)?;
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::Softmax { axis } => {
            expect_arity(op, inputs, 1, 1)?;
            expect_real(op, &inputs[0])?;
            expect_axis(&inputs[0].shape, *axis)?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::Mvn { axes, eps } => {
            expect_arity(op, inputs, 1, 1)?;
            expect_real(op, &inputs[0])?;
            if *eps < 0.0 {
                return Err(format!("Mvn eps must be non-negative, got {eps}"));
            }
            for axis in axes {
                expect_axis(&inputs[0].shape, *axis)?;
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::GroupNormalization { num_groups, .. } => {
            expect_arity(op, inputs, 3, 3)?;
            expect_real(op, &inputs[0])?;
            expect_same_type(op, &inputs[0], &inputs[1])?;
            expect_same_type(op, &inputs[0], &inputs[2])?;
            if *num_groups == 0 {
                return Err("GroupNormalization needs at least one group".into());
            }
            if let Some(rank) = inputs[0].shape.rank()
                && rank < 2
            {
                return Err(format!("GroupNormalization data rank must be >= 2, got {rank}"));
            }
            if let Some(Dim::Static(channels)) = inputs[0].shape.dim(1)
                && channels % num_groups != 0
            {
                return Err(format!(
                    "channel count {channels} is not divisible by {num_groups} groups"
                ));
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::ScaledDotProductAttention { .. } => {
            expect_arity(op, inputs, 3, 5)?;
            expect_real(op, &inputs[0])?;
            expect_same_type(op, &inputs[0], &inputs[1])?;
            expect_same_type(op, &inputs[0], &inputs[2])?;
            let shape = match (inputs[0].shape.dims(), inputs[2].shape.dims()) {
                (Some(q), Some(v)) if !q.is_empty() && !v.is_empty() => {
                    let mut dims = q.to_vec();
                    let last = dims.len() - 1;
                    dims[last] = v[v.len() - 1];
                    PartialShape::new(dims)
                }
                _ => PartialShape::dynamic(),
            };
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::FakeQuantize { levels } => {
            expect_arity(op, inputs, 5, 5)?;
            expect_real(op, &inputs[0])?;
            for limit in &inputs[1..] {
                expect_same_type(op, &inputs[0], limit)?;
            }
            if *levels < 2 {
                return Err(format!("FakeQuantize levels must be >= 2, got {levels}"));
            }
            Ok(vec![inputs[0].clone()])
        }
        OpKind::ShapeOf { output_type } => {
            expect_arity(op, inputs, 1, 1)?;
            if !matches!(output_type, ElementType::I32 | ElementType::I64) {
                return Err(format!("ShapeOf output type must be i32 or i64, got {output_type}"));
            }
            let shape = match inputs[0].shape.rank() {
                Some(rank) => PartialShape::from_static(&[rank]),
                None => PartialShape::new(vec![Dim::Dynamic]),
            };
            Ok(vec![TensorDesc::new(*output_type, shape)])
        }
        OpKind::Gather { axis } => {
            expect_arity(op, inputs, 2, 2)?;
            if !inputs[1].element_type.is_integral() {
                return Err(format!("Gather indices must be integral, got {}", inputs[1].element_type));
            }
            let shape = match (inputs[0].shape.dims(), inputs[1].shape.dims()) {
                (Some(data), Some(indices)) => {
                    let axis = normalize_axis(*axis, data.len())
                        .ok_or_else(|| format!("Gather axis {axis} out of range"))?;
                    let mut dims = data[..axis].to_vec();
                    dims.extend_from_slice(indices);
                    dims.extend_from_slice(&data[axis + 1..]);
                    PartialShape::new(dims)
                }
                _ => PartialShape::dynamic(),
            };
            Ok(vec![TensorDesc::new(inputs[0].element_type, shape)])
        }
        OpKind::PagedAttention => {
            if inputs.len() < 3 {
                return Err(format!("PagedAttention expects at least 3 inputs, got {}", inputs.len()));
            }
            expect_same_type(op, &inputs[0], &inputs[1])?;
            expect_same_type(op, &inputs[0], &inputs[2])?;
            Ok(vec![inputs[0].clone()])
        }
        OpKind::QkvProjection => {
            if inputs.len() < 2 {
                return Err(format!("QkvProjection expects at least 2 inputs, got {}", inputs.len()));
            }
            let mut outputs = Vec::with_capacity(inputs.len() - 1);
            for weight in &inputs[1..] {
                expect_same_type(op, &inputs[0], weight)?;
                outputs.push(TensorDesc::new(
                    inputs[0].element_type,
                    matmul_shape(&inputs[0].shape, &weight.shape, false, true)?,
                ));
            }
            Ok(outputs)
        }
    }
}

fn expect_arity(op: &OpKind, inputs: &[TensorDesc], min: usize, max: usize) -> Result<(), String> {
    if (min..=max).contains(&inputs.len()) {
        Ok(())
    } else if min == max {
        Err(format!("{op} expects {min} input(s), got {}", inputs.len()))
    } else {
        Err(format!("{op} expects {min}..={max} inputs, got {}", inputs.len()))
    }
}

fn expect_same_type(op: &OpKind, a: &TensorDesc, b: &TensorDesc) -> Result<(), String> {
    if a.element_type == b.element_type {
        Ok(())
    } else {
        Err(format!(
            "{op} input element types disagree: {} vs {}",
            a.element_type, b.element_type
        ))
    }
}

fn expect_real(op: &OpKind, desc: &TensorDesc) -> Result<(), String> {
    if desc.element_type.is_real() {
        Ok(())
    } else {
        Err(format!("{op} requires a floating-point input, got {}", desc.element_type))
    }
}

fn expect_numeric(op: &OpKind, desc: &TensorDesc) -> Result<(), String> {
    if desc.element_type == ElementType::Boolean {
        Err(format!("{op} does not accept boolean input"))
    } else {
        Ok(())
    }
}

fn expect_axis(shape: &PartialShape, axis: i64) -> Result<(), String> {
    match shape.rank() {
        Some(rank) if normalize_axis(axis, rank).is_none() => {
            Err(format!("axis {axis} out of range for rank {rank}"))
        }
        _ => Ok(()),
    }
}

/// Shape of `a @ b` with optional transposition of the trailing two axes.
pub fn matmul_shape(
    a: &PartialShape,
    b: &PartialShape,
    transpose_a: bool,
    transpose_b: bool,
) -> Result<PartialShape, String> {
    let (Some(da), Some(db)) = (a.dims(), b.dims()) else {
        return Ok(PartialShape::dynamic());
    };
    if da.is_empty() || db.is_empty() {
        return Err("MatMul inputs must have rank >= 1".into());
    }
    let mut da = da.to_vec();
    let mut db = db.to_vec();
    let a_vec = da.len() == 1;
    let b_vec = db.len() == 1;
    if a_vec {
        da.insert(0, Dim::Static(1));
    }
    if b_vec {
        db.push(Dim::Static(1));
    }
    if transpose_a && !a_vec {
        let n = da.len();
        da.swap(n - 1, n - 2);
    }
    if transpose_b && !b_vec {
        let n = db.len();
        db.swap(n - 1, n - 2);
    }
    let (m, ka) = (da[da.len() - 2], da[da.len() - 1]);
    let (kb, n) = (db[db.len() - 2], db[db.len() - 1]);
    if let (Dim::Static(x), Dim::Static(y)) = (ka, kb)
        && x != y
    {
        return Err(format!("MatMul inner dimensions disagree: {x} vs {y}"));
    }
    let batch_a = PartialShape::new(da[..da.len() - 2].to_vec());
    let batch_b = PartialShape::new(db[..db.len() - 2].to_vec());
    let batch = PartialShape::broadcast(&batch_a, &batch_b)?;
    let mut dims = batch.dims().map(<[Dim]>::to_vec).unwrap_or_default();
    if !a_vec {
        dims.push(m);
    }
    if !b_vec {
        dims.push(n);
    }
    Ok(PartialShape::new(dims))
}

fn reshape_shape(input: &PartialShape, target: &[i64]) -> Result<PartialShape, String> {
    if target.iter().filter(|&&d| d == -1).count() > 1 {
        return Err("Reshape target may contain at most one -1".into());
    }
    let mut dims = Vec::with_capacity(target.len());
    for (i, &t) in target.iter().enumerate() {
        let dim = match t {
            0 => input.dims().and_then(|d| d.get(i).copied()).ok_or_else(|| {
                format!("Reshape copies dimension {i} that the input does not have")
            })?,
            -1 => Dim::Dynamic,
            d if d > 0 => Dim::Static(d as usize),
            d => return Err(format!("invalid Reshape target dimension {d}")),
        };
        dims.push(dim);
    }
    if let Some(total) = input.element_count() {
        let known: usize = dims.iter().filter_map(|d| d.as_static()).product();
        match target.iter().position(|&d| d == -1) {
            Some(idx) => {
                if known == 0 || total % known != 0 {
                    return Err(format!("cannot reshape {input} to {target:?}"));
                }
                dims[idx] = Dim::Static(total / known);
            }
            None if dims.iter().all(|d| !d.is_dynamic()) && known != total => {
                return Err(format!("cannot reshape {input} to {target:?}"));
            }
            None => {}
        }
    }
    Ok(PartialShape::new(dims))
}

fn transpose_shape(input: &PartialShape, order: &[usize]) -> Result<PartialShape, String> {
    let Some(dims) = input.dims() else {
        return Ok(PartialShape::dynamic());
    };
    if order.len() != dims.len() {
        return Err(format!("Transpose order {order:?} does not match rank {}", dims.len()));
    }
    let mut seen = vec![false; dims.len()];
    for &axis in order {
        if axis >= dims.len() || std::mem::replace(&mut seen[axis], true) {
            return Err(format!("Transpose order {order:?} is not a permutation"));
        }
    }
    Ok(PartialShape::new(order.iter().map(|&axis| dims[axis]).collect()))
}

fn reduce_shape(input: &PartialShape, axes: &[i64], keep_dims: bool) -> Result<PartialShape, String> {
    let Some(dims) = input.dims() else {
        return Ok(PartialShape::dynamic());
    };
    let mut reduced = vec![false; dims.len()];
    for &axis in axes {
        let idx = normalize_axis(axis, dims.len())
            .ok_or_else(|| format!("reduction axis {axis} out of range for rank {}", dims.len()))?;
        reduced[idx] = true;
    }
    let out = dims
        .iter()
        .zip(&reduced)
        .filter_map(|(&d, &r)| match (r, keep_dims) {
            (false, _) => Some(d),
            (true, true) => Some(Dim::Static(1)),
            (true, false) => None,
        })
        .collect();
    Ok(PartialShape::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_desc(dims: &[usize]) -> TensorDesc {
        TensorDesc::new(ElementType::F32, PartialShape::from_static(dims))
    }

    #[test]
    fn binary_requires_equal_types() {
        let a = f32_desc(&[2]);
        let b = TensorDesc::new(ElementType::I32, PartialShape::from_static(&[2]));
        let err = infer_outputs(&OpKind::Add, &[a, b]).unwrap_err();
        assert!(err.contains("disagree"));
    }

    #[test]
    fn matmul_with_transpose_b() {
        let out = infer_outputs(
            &OpKind::MatMul { transpose_a: false, transpose_b: true },
            &[f32_desc(&[4, 2, 8]), f32_desc(&[16, 8])],
        )
        .unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[4, 2, 16]));
    }

    #[test]
    fn matmul_rejects_inner_mismatch() {
        let err = infer_outputs(
            &OpKind::MatMul { transpose_a: false, transpose_b: false },
            &[f32_desc(&[2, 3]), f32_desc(&[4, 5])],
        )
        .unwrap_err();
        assert!(err.contains("inner dimensions"));
    }

    #[test]
    fn reshape_infers_wildcard_and_copies_zero() {
        let out =
            infer_outputs(&OpKind::Reshape { target: vec![0, -1] }, &[f32_desc(&[2, 3, 4])]).unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[2, 12]));
    }

    #[test]
    fn reshape_rejects_bad_count() {
        assert!(infer_outputs(&OpKind::Reshape { target: vec![5] }, &[f32_desc(&[2, 3])]).is_err());
    }

    #[test]
    fn transpose_permutes() {
        let out = infer_outputs(&OpKind::Transpose { order: vec![0, 2, 1] }, &[f32_desc(&[1, 2, 3])])
            .unwrap();
        assert_eq!(out[0].shape, PartialShape::from_static(&[1, 3, 2]));
        assert!(infer_outputs(&OpKind::Transpose { order: vec![0, 0, 1] }, &[f32_desc(&[1, 2, 3])])
            .is_err());
    }

    #[test]
    fn reduce_keeps_or_drops_axes() {
        let keep = infer_outputs(
            &OpKind::ReduceSum { axes: vec![-1], keep_dims: true },
            &[f32_desc(&[2, 5])],
        )
        .unwrap();
        assert_eq!(keep[0].shape, PartialShape::from_static(&[2, 1]));
        let drop = infer_outputs(
            &OpKind::ReduceMax { axes: vec![0], keep_dims: false },
            &[f32_desc(&[2, 5])],
        )
        .unwrap();
        assert_eq!(drop[0].shape, PartialShape::from_static(&[5]));
    }

    #[test]
    fn convert_changes_only_the_type() {
        let out = infer_outputs(&OpKind::Convert { destination: ElementType::U8 }, &[f32_desc(&[3])])
            .unwrap();
        assert_eq!(out[0], TensorDesc::new(ElementType::U8, PartialShape::from_static(&[3])));
    }

    #[test]
    fn fake_quantize_needs_matching_limits() {
        let data = f32_desc(&[1, 4]);
        let lim = f32_desc(&[]);
        let ok = infer_outputs(
            &OpKind::FakeQuantize { levels: 256 },
            &[data.clone(), lim.clone(), lim.clone(), lim.clone(), lim.clone()],
        );
        assert!(ok.is_ok());
        let bad_lim = TensorDesc::new(ElementType::F16, PartialShape::scalar());
        let err = infer_outputs(
            &OpKind::FakeQuantize { levels: 256 },
            &[data, lim.clone(), lim.clone(), lim, bad_lim],
        );
        assert!(err.is_err());
    }

    #[test]
    fn group_norm_checks_channel_divisibility() {
        let op = OpKind::GroupNormalization { num_groups: 4, eps: 1e-5 };
        let ok = infer_outputs(&op, &[f32_desc(&[1, 8, 4]), f32_desc(&[8]), f32_desc(&[8])]);
        assert!(ok.is_ok());
        let bad = infer_outputs(&op, &[f32_desc(&[1, 6, 4]), f32_desc(&[6]), f32_desc(&[6])]);
        assert!(bad.is_err());
    }

    #[test]
    fn qkv_projection_has_one_output_per_weight() {
        let out = infer_outputs(
            &OpKind::QkvProjection,
            &[f32_desc(&[1, 7, 64]), f32_desc(&[64, 64]), f32_desc(&[16, 64]), f32_desc(&[16, 64])],
        )
        .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].shape, PartialShape::from_static(&[1, 7, 16]));
    }
}
