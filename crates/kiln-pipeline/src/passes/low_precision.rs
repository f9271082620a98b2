//! Low-precision lowering: quantizing FakeQuantize nodes into integer
//! dequantization chains and folding the converts around them.

use super::{constant_of, input_of, uniform_value};
use crate::pass::Pass;
use kiln_graph::{ElementType, Graph, InputRef, NodeId, OpKind, OutputRef, cast_value};
use kiln_patterns::INT8_PRECISIONS;
use tracing::{debug, trace};

pub const QUANTIZE_FAKE_QUANTIZE: &str = "QuantizeFakeQuantize";
pub const FOLD_CONVERT: &str = "FoldConvert";
pub const FUSE_CONVERT: &str = "FuseConvert";

// ── Precision restrictions ───────────────────────────────────────────

/// Low precisions each quantized consumer accepts on its inputs.
///
/// Consumers without a restriction accept any precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecisionRestrictions {
    matmul_activation: Vec<ElementType>,
    matmul_weights: Vec<ElementType>,
    multiply: Vec<ElementType>,
}

impl PrecisionRestrictions {
    /// MatMul activations take `activation`, MatMul weights take `i8`,
    /// Multiply takes either 8-bit type.
    pub fn new(activation: Vec<ElementType>) -> Self {
        Self {
            matmul_activation: activation,
            matmul_weights: vec![ElementType::I8],
            multiply: INT8_PRECISIONS.to_vec(),
        }
    }

    pub fn allowed(&self, op: &OpKind, port: usize) -> Option<&[ElementType]> {
        match op {
            OpKind::MatMul { .. } if port == 0 => Some(&self.matmul_activation),
            OpKind::MatMul { .. } => Some(&self.matmul_weights),
            OpKind::Multiply => Some(&self.multiply),
            _ => None,
        }
    }

    /// Whether every consumer of `output` accepts `ty` at the port it reads.
    pub fn admits(&self, graph: &Graph, output: OutputRef, ty: ElementType) -> bool {
        graph.consumers(output).into_iter().all(|InputRef { node, port }| {
            graph
                .node(node)
                .and_then(|n| self.allowed(&n.op, port))
                .is_none_or(|allowed| allowed.contains(&ty))
        })
    }
}

// ── FakeQuantize quantization ────────────────────────────────────────

/// Integer range an 8-bit FakeQuantize maps onto.
pub const fn quantized_range(ty: ElementType, levels: u32) -> Option<(f64, f64)> {
    match (ty, levels) {
        (ElementType::U8, 256) => Some((0.0, 255.0)),
        (ElementType::U8, 255) => Some((0.0, 254.0)),
        (ElementType::I8, 256) => Some((-128.0, 127.0)),
        (ElementType::I8, 255) => Some((-127.0, 127.0)),
        _ => None,
    }
}

/// Parameters of one quantizable FakeQuantize.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Quantization {
    target: ElementType,
    q_low: f64,
    q_high: f64,
    scale: f64,
    zero_point: f64,
}

fn plan_quantization(
    graph: &Graph,
    id: NodeId,
    precisions: &[ElementType],
    restrictions: &PrecisionRestrictions,
) -> Option<Quantization> {
    let node = graph.node(id)?;
    let OpKind::FakeQuantize { levels } = node.op else {
        return None;
    };
    let limits: Vec<f64> = (1..5)
        .map(|port| input_of(graph, id, port).and_then(|src| constant_of(graph, src.node)).and_then(uniform_value))
        .collect::<Option<_>>()?;
    let (out_low, out_high) = (limits[2], limits[3]);
    let target = if out_low >= 0.0 { ElementType::U8 } else { ElementType::I8 };
    if !precisions.contains(&target) || !restrictions.admits(graph, id.into(), target) {
        trace!(node = %node, %target, "fake quantize not quantized: precision not allowed");
        return None;
    }
    let (q_low, q_high) = quantized_range(target, levels)?;
    let scale = (out_high - out_low) / (q_high - q_low);
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }
    Some(Quantization { target, q_low, q_high, scale, zero_point: q_low - out_low / scale })
}

/// `FQ(x) -> FQ'(x, [qlo, qhi]) -> Convert(low) -> Convert(back) ->
/// [Subtract(zp)] -> Multiply(scale)`.
fn quantize(graph: &mut Graph, id: NodeId, plan: Quantization) -> kiln_graph::Result<()> {
    let Some(node) = graph.node(id) else {
        return Ok(());
    };
    let name = node.name.clone();
    let op = node.op.clone();
    let inputs = node.inputs.clone();
    let Some(ty) = node.output_type() else {
        return Ok(());
    };

    let q_low = graph.add_scalar(format!("{name}/q_low"), ty, plan.q_low)?;
    let q_high = graph.add_scalar(format!("{name}/q_high"), ty, plan.q_high)?;
    let quantized = graph.add_node(
        format!("{name}/quantize"),
        op,
        vec![inputs[0], inputs[1], inputs[2], q_low.into(), q_high.into()],
    )?;
    let low = graph.add_node(format!("{name}/to_{}", plan.target), OpKind::Convert { destination: plan.target }, vec![
        quantized.into(),
    ])?;
    let back = graph.add_node(format!("{name}/dequantize"), OpKind::Convert { destination: ty }, vec![low.into()])?;
    let mut chain = vec![back];
    let mut last = back;
    if plan.zero_point != 0.0 {
        let zp = graph.add_scalar(format!("{name}/zero_point"), ty, plan.zero_point)?;
        last = graph.add_node(format!("{name}/sub"), OpKind::Subtract, vec![back.into(), zp.into()])?;
        chain.push(last);
    }
    let scale = graph.add_scalar(format!("{name}/scale"), ty, plan.scale)?;
    let multiply = graph.add_node(name, OpKind::Multiply, vec![last.into(), scale.into()])?;
    chain.push(multiply);
    for id in chain {
        if let Some(n) = graph.node_mut(id) {
            n.rt.dequantization = true;
        }
    }
    graph.replace_node(id, multiply)
}

/// Lowers 8-bit FakeQuantize nodes with per-tensor ranges to an integer
/// convert followed by a dequantization chain.
///
/// Only targets listed in `precisions` and admitted by every consumer's
/// restrictions are produced; an empty list makes the pass a no-op.
pub fn quantize_fake_quantize(precisions: Vec<ElementType>, restrictions: PrecisionRestrictions) -> Pass {
    Pass::from_fn(QUANTIZE_FAKE_QUANTIZE, move |graph, scope| {
        if precisions.is_empty() {
            return Ok(false);
        }
        let candidates = scope.candidates(graph, |v| matches!(v.op(), OpKind::FakeQuantize { levels: 255 | 256 }))?;
        let mut quantized = 0usize;
        for id in candidates {
            let Some(plan) = plan_quantization(graph, id, &precisions, &restrictions) else {
                continue;
            };
            quantize(graph, id, plan)?;
            quantized += 1;
        }
        if quantized > 0 {
            debug!(quantized, "quantized fake quantize nodes");
        }
        Ok(quantized > 0)
    })
}

// ── Convert folding ──────────────────────────────────────────────────

/// Folds `Constant -> Convert` into a constant of the destination type.
///
/// Decompression and kept converts stay.
pub fn fold_convert() -> Pass {
    Pass::from_fn(FOLD_CONVERT, |graph, scope| {
        let candidates = scope.candidates(graph, |v| {
            let rt = &v.node().rt;
            v.op().is_convert()
                && !rt.decompression
                && !rt.keep_precision
                && v.input(0).is_some_and(|src| src.op().is_constant() && !src.node().rt.keep_precision)
        })?;
        let mut folded = 0usize;
        for id in candidates {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let OpKind::Convert { destination } = node.op else {
                continue;
            };
            let name = node.name.clone();
            let Some(data) = input_of(graph, id, 0).and_then(|src| constant_of(graph, src.node)) else {
                continue;
            };
            let values = data.values.iter().map(|&v| cast_value(v, destination)).collect();
            let shape = data.shape.clone();
            let constant = graph.add_constant(name, destination, &shape, values)?;
            graph.replace_node(id, constant)?;
            folded += 1;
        }
        if folded > 0 {
            graph.remove_dead_nodes();
        }
        Ok(folded > 0)
    })
}

/// Root of a `op(x, Constant) -> Convert(real)` chain the convert can be
/// fused into.
fn fuse_convert_target(graph: &Graph, id: NodeId) -> Option<(NodeId, ElementType)> {
    let node = graph.node(id)?;
    if !matches!(node.op, OpKind::Add | OpKind::Subtract | OpKind::Multiply) || node.rt.dequantization {
        return None;
    }
    constant_of(graph, input_of(graph, id, 1)?.node)?;
    let from = node.output_type()?;
    let consumers = graph.consumer_nodes(id.into());
    let [convert] = consumers.as_slice() else {
        return None;
    };
    let convert = *convert;
    let consumer = graph.node(convert)?;
    match consumer.op {
        OpKind::Convert { destination } if destination.is_real() && from.is_real() && destination != from => {
            (graph.all_consumers(id).len() == 1).then_some((convert, destination))
        }
        _ => None,
    }
}

/// Computes `op(x, c) -> Convert(U)` directly in `U`.
pub fn fuse_convert() -> Pass {
    Pass::from_fn(FUSE_CONVERT, |graph, scope| {
        let candidates = scope.candidates(graph, |v| matches!(v.op(), OpKind::Add | OpKind::Subtract | OpKind::Multiply))?;
        let mut fused = 0usize;
        for id in candidates {
            let Some((convert, to)) = fuse_convert_target(graph, id) else {
                continue;
            };
            let (Some(x), Some(c)) = (input_of(graph, id, 0), input_of(graph, id, 1)) else {
                continue;
            };
            let Some(data) = constant_of(graph, c.node) else {
                continue;
            };
            let values: Vec<f64> = data.values.iter().map(|&v| cast_value(v, to)).collect();
            let shape = data.shape.clone();
            let (Some(op), Some(convert_name)) =
                (graph.node(id).map(|n| n.op.clone()), graph.node(convert).map(|n| n.name.clone()))
            else {
                continue;
            };
            let constant_name = format!("{convert_name}/constant");
            let x = graph.add_node(format!("{convert_name}/input"), OpKind::Convert { destination: to }, vec![x])?;
            let constant = graph.add_constant(constant_name, to, &shape, values)?;
            let fused_node = graph.add_node(convert_name, op, vec![x.into(), constant.into()])?;
            graph.replace_node(convert, fused_node)?;
            fused += 1;
        }
        if fused > 0 {
            graph.remove_dead_nodes();
        }
        Ok(fused > 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::{PartialShape, Tensor, evaluate};
    use std::collections::BTreeMap;

    fn fq_into_matmul(out_low: f64, levels: u32) -> (Graph, NodeId) {
        let mut g = Graph::new("lpt");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[1, 4]));
        let il = g.add_scalar("il", ElementType::F32, 0.0).unwrap();
        let ih = g.add_scalar("ih", ElementType::F32, 2.55).unwrap();
        let ol = g.add_scalar("ol", ElementType::F32, out_low).unwrap();
        let oh = g.add_scalar("oh", ElementType::F32, out_low + 2.55).unwrap();
        let fq = g
            .add_node("fq", OpKind::FakeQuantize { levels }, vec![x.into(), il.into(), ih.into(), ol.into(), oh.into()])
            .unwrap();
        let w = g.add_constant("w", ElementType::F32, &[2, 4], vec![0.5]).unwrap();
        let mm = g
            .add_node("mm", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![fq.into(), w.into()])
            .unwrap();
        g.add_result("out", mm.into()).unwrap();
        (g, x)
    }

    fn run(g: &Graph, x: NodeId) -> Vec<f64> {
        let input = Tensor::new(ElementType::F32, vec![1, 4], vec![0.0, 0.5, 1.27, 3.0]);
        evaluate(g, &BTreeMap::from([(x, input)])).unwrap().remove(0).values
    }

    #[test]
    fn unsigned_fake_quantize_becomes_u8_chain() {
        let (mut g, x) = fq_into_matmul(0.0, 256);
        let expected = run(&g, x);
        let pass = quantize_fake_quantize(INT8_PRECISIONS.to_vec(), PrecisionRestrictions::new(vec![ElementType::U8]));
        assert!(pass.apply(&mut g).unwrap());
        g.validate().unwrap();
        assert!(g.element_types().contains(&ElementType::U8));
        // Zero point is zero for an unsigned range starting at 0.
        assert_eq!(g.count_op("Subtract"), 0);
        let mul = g.nodes().find(|n| n.name == "fq").unwrap();
        assert!(matches!(mul.op, OpKind::Multiply) && mul.rt.dequantization);
        for (a, b) in run(&g, x).iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn signed_target_is_rejected_by_activation_restriction() {
        let (mut g, _) = fq_into_matmul(-1.28, 256);
        let pass = quantize_fake_quantize(INT8_PRECISIONS.to_vec(), PrecisionRestrictions::new(vec![ElementType::U8]));
        assert!(!pass.apply(&mut g).unwrap());
        assert_eq!(g.count_op("FakeQuantize"), 1);

        let pass = quantize_fake_quantize(INT8_PRECISIONS.to_vec(), PrecisionRestrictions::new(INT8_PRECISIONS.to_vec()));
        assert!(pass.apply(&mut g).unwrap());
        assert!(g.element_types().contains(&ElementType::I8));
    }

    #[test]
    fn empty_precision_list_quantizes_nothing() {
        let (mut g, _) = fq_into_matmul(0.0, 256);
        let pass = quantize_fake_quantize(Vec::new(), PrecisionRestrictions::new(vec![ElementType::U8]));
        assert!(!pass.apply(&mut g).unwrap());
    }

    #[test]
    fn narrow_ranges() {
        assert_eq!(quantized_range(ElementType::U8, 255), Some((0.0, 254.0)));
        assert_eq!(quantized_range(ElementType::I8, 255), Some((-127.0, 127.0)));
        assert_eq!(quantized_range(ElementType::I8, 16), None);
    }

    #[test]
    fn constant_convert_folds() {
        let mut g = Graph::new("fold");
        let c = g.add_constant("c", ElementType::F32, &[2], vec![1.7, -2.2]).unwrap();
        let cvt = g.add_node("cvt", OpKind::Convert { destination: ElementType::I32 }, vec![c.into()]).unwrap();
        g.add_result("out", cvt.into()).unwrap();
        assert!(fold_convert().apply(&mut g).unwrap());
        let folded = g.nodes().find(|n| n.name == "cvt").unwrap();
        assert!(matches!(&folded.op, OpKind::Constant(d) if d.values == vec![1.0, -2.0]));
        g.validate().unwrap();
    }

    #[test]
    fn decompression_convert_is_not_folded() {
        let mut g = Graph::new("fold");
        let c = g.add_constant("c", ElementType::U8, &[2], vec![1.0]).unwrap();
        let cvt = g.add_node("cvt", OpKind::Convert { destination: ElementType::F32 }, vec![c.into()]).unwrap();
        g.node_mut(cvt).unwrap().rt.decompression = true;
        g.add_result("out", cvt.into()).unwrap();
        assert!(!fold_convert().apply(&mut g).unwrap());
    }

    #[test]
    fn trailing_convert_is_fused() {
        let mut g = Graph::new("fuse");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2]));
        let c = g.add_scalar("c", ElementType::F32, 2.0).unwrap();
        let mul = g.add_node("mul", OpKind::Multiply, vec![x.into(), c.into()]).unwrap();
        let cvt = g.add_node("cvt", OpKind::Convert { destination: ElementType::F16 }, vec![mul.into()]).unwrap();
        g.add_result("out", cvt.into()).unwrap();

        assert!(fuse_convert().apply(&mut g).unwrap());
        g.validate().unwrap();
        let fused = g.nodes().find(|n| n.name == "cvt").unwrap();
        assert!(matches!(fused.op, OpKind::Multiply));
        assert_eq!(fused.output_type(), Some(ElementType::F16));
        assert!(g.node(mul).is_none());
    }
}
