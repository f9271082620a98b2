//! Quantized-model detection and low-precision constants.

use kiln_common::{CpuFeature, ElementType};
use kiln_device_probe::CapabilityReport;
use kiln_graph::{Graph, NodeView, OpKind};

/// FakeQuantize level counts the low-precision lowering understands:
/// int4, int4 narrow range, int8, int8 narrow range.
pub const SUPPORTED_FQ_LEVELS: [u32; 4] = [16, 15, 256, 255];

/// Element types a compressed weight constant may carry.
pub const DECOMPRESSION_PRECISIONS: [ElementType; 5] =
    [ElementType::U8, ElementType::I8, ElementType::U4, ElementType::I4, ElementType::Nf4];

/// Default low precisions when quantized lowering is active.
pub const INT8_PRECISIONS: [ElementType; 2] = [ElementType::U8, ElementType::I8];

/// Highest rank a native FakeQuantize kernel handles.
pub const MAX_FAKE_QUANTIZE_RANK: usize = 5;

/// Whether the graph contains a FakeQuantize with one of `levels`.
pub fn is_quantized_model(graph: &Graph, levels: &[u32]) -> bool {
    graph.nodes().any(|n| matches!(n.op, OpKind::FakeQuantize { levels: l } if levels.contains(&l)))
}

/// Whether the backend runs this FakeQuantize natively.
///
/// Range inputs must be constants and the data rank must be static and at
/// most [`MAX_FAKE_QUANTIZE_RANK`].
pub fn is_supported_fake_quantize(view: &NodeView<'_>) -> bool {
    if !matches!(view.op(), OpKind::FakeQuantize { .. }) {
        return false;
    }
    let ranges_const = (1..view.input_count())
        .all(|port| view.input(port).is_some_and(|p| p.op().is_constant()));
    let rank_ok = view
        .input_desc(0)
        .and_then(|d| d.shape.rank())
        .is_some_and(|rank| rank <= MAX_FAKE_QUANTIZE_RANK);
    ranges_const && rank_ok
}

/// Precisions accepted on the activation input of quantized matrix multiplies.
///
/// Signed activations need AMX or AVX2-VNNI-2.
pub fn activation_precisions(report: &CapabilityReport) -> Vec<ElementType> {
    if report.supports(CpuFeature::Amx) || report.supports(CpuFeature::Avx2Vnni2) {
        vec![ElementType::U8, ElementType::I8]
    } else {
        vec![ElementType::U8]
    }
}

/// Whether an elementwise node may move above the data-movement node feeding
/// it without changing results.
///
/// Nodes that change element type stay put, as do nodes scaled by an 8-bit
/// second operand and FakeQuantize nodes not fed by a transpose.
pub fn can_move_eltwise_up(view: &NodeView<'_>) -> bool {
    let is_fq = matches!(view.op(), OpKind::FakeQuantize { .. });
    let in_type = view.input_desc(0).map(|d| d.element_type);
    let out_type = view.output(0).map(|d| d.element_type);
    if !is_fq && in_type != out_type {
        return false;
    }
    if view.input_count() >= 2 {
        let second_8bit = view
            .input_desc(1)
            .is_some_and(|d| matches!(d.element_type, ElementType::I8 | ElementType::U8));
        let fq_not_after_transpose = is_fq
            && !view.input(0).is_some_and(|p| matches!(p.op(), OpKind::Transpose { .. }));
        return !(second_8bit || fq_not_after_transpose);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_graph::PartialShape;

    fn fq_graph(levels: u32, rank: usize) -> (Graph, kiln_graph::NodeId) {
        let mut g = Graph::new("fq");
        let dims = vec![2; rank];
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&dims));
        let lo = g.add_scalar("lo", ElementType::F32, 0.0).unwrap();
        let hi = g.add_scalar("hi", ElementType::F32, 1.0).unwrap();
        let fq = g
            .add_node("fq", OpKind::FakeQuantize { levels }, vec![
                x.into(),
                lo.into(),
                hi.into(),
                lo.into(),
                hi.into(),
            ])
            .unwrap();
        g.add_result("out", fq.into()).unwrap();
        (g, fq)
    }

    #[test]
    fn quantized_model_requires_supported_levels() {
        assert!(is_quantized_model(&fq_graph(256, 4).0, &SUPPORTED_FQ_LEVELS));
        assert!(is_quantized_model(&fq_graph(15, 4).0, &SUPPORTED_FQ_LEVELS));
        assert!(!is_quantized_model(&fq_graph(3, 4).0, &SUPPORTED_FQ_LEVELS));
        assert!(!is_quantized_model(&Graph::new("empty"), &SUPPORTED_FQ_LEVELS));
    }

    #[test]
    fn fake_quantize_support_is_rank_bound() {
        let (g, fq) = fq_graph(256, 5);
        assert!(is_supported_fake_quantize(&NodeView::new(&g, fq).unwrap()));
        let (g, fq) = fq_graph(256, 6);
        assert!(!is_supported_fake_quantize(&NodeView::new(&g, fq).unwrap()));
    }

    #[test]
    fn fake_quantize_with_dynamic_range_is_unsupported() {
        let mut g = Graph::new("fq");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 2]));
        let lo = g.add_parameter("lo", ElementType::F32, PartialShape::scalar());
        let hi = g.add_scalar("hi", ElementType::F32, 1.0).unwrap();
        let fq = g
            .add_node("fq", OpKind::FakeQuantize { levels: 256 }, vec![
                x.into(),
                lo.into(),
                hi.into(),
                lo.into(),
                hi.into(),
            ])
            .unwrap();
        assert!(!is_supported_fake_quantize(&NodeView::new(&g, fq).unwrap()));
    }

    #[test]
    fn eltwise_with_u8_operand_stays() {
        let mut g = Graph::new("m");
        let x = g.add_parameter("x", ElementType::U8, PartialShape::from_static(&[2, 2]));
        let s = g.add_scalar("s", ElementType::U8, 2.0).unwrap();
        let mul = g.add_node("mul", OpKind::Multiply, vec![x.into(), s.into()]).unwrap();
        let relu = g.add_node("relu", OpKind::Relu, vec![x.into()]).unwrap();
        assert!(!can_move_eltwise_up(&NodeView::new(&g, mul).unwrap()));
        assert!(can_move_eltwise_up(&NodeView::new(&g, relu).unwrap()));
    }
}
