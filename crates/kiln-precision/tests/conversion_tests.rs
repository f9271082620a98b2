//! End-to-end behaviour of the conversion engine.

use kiln_common::{CpuFeature, ElementType, IsaFamily, PipelineConfig};
use kiln_device_probe::{CapabilityReport, StaticProbe};
use kiln_graph::{Graph, InputRef, NodeId, OpKind, PartialShape, Tensor, evaluate};
use kiln_precision::{
    BACKEND_TYPES, ConvertOptions, PrecisionMap, base_conversion_map, convert_precision,
    default_conversion_map,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn avx2_report() -> CapabilityReport {
    let probe = StaticProbe::new(IsaFamily::X64).with_features([CpuFeature::Avx2]);
    CapabilityReport::snapshot(&probe, &PipelineConfig::default())
}

/// `x -> Convert(boolean) -> Result`, returning the graph and the parameter.
fn to_bool_graph(input: ElementType) -> (Graph, NodeId) {
    let mut g = Graph::new("to_bool");
    let x = g.add_parameter("x", input, PartialShape::from_static(&[3]));
    let cvt =
        g.add_node("to_bool", OpKind::Convert { destination: ElementType::Boolean }, vec![x.into()]).unwrap();
    g.add_result("out", cvt.into()).unwrap();
    (g, x)
}

fn run(g: &Graph, x: NodeId, ty: ElementType, values: Vec<f64>) -> Tensor {
    let inputs = BTreeMap::from([(x, Tensor::new(ty, vec![values.len()], values))]);
    evaluate(g, &inputs).unwrap().remove(0)
}

#[test]
fn boolean_cast_saturates_instead_of_wrapping() {
    let (mut g, x) = to_bool_graph(ElementType::F32);
    let stats = convert_precision(&mut g, &base_conversion_map(), &ConvertOptions::default()).unwrap();
    assert_eq!(stats.fused_boolean_casts, 1);
    g.validate().unwrap();

    let out = run(&g, x, ElementType::F32, vec![0.01, 256.0, -256.0]);
    assert_eq!(out.element_type, ElementType::U8);
    assert_eq!(out.values, vec![1.0, 255.0, 255.0]);
    assert_eq!(out.as_bools(), vec![true, true, true]);

    let zero = run(&g, x, ElementType::F32, vec![0.0, -0.0, 1e-30]);
    assert_eq!(zero.as_bools(), vec![false, false, true]);
}

#[test]
fn boolean_cast_keeps_the_friendly_name() {
    let (mut g, _) = to_bool_graph(ElementType::F32);
    convert_precision(&mut g, &base_conversion_map(), &ConvertOptions::default()).unwrap();
    let out = g.results()[0];
    let src = g.producer(InputRef::new(out, 0)).unwrap();
    let node = g.node(src.node).unwrap();
    assert_eq!(node.name, "to_bool");
    assert_eq!(node.op, OpKind::Convert { destination: ElementType::U8 });
    assert_eq!(g.nodes().filter(|n| n.name == "to_bool").count(), 1);
}

#[test]
fn boolean_cast_from_kept_f64_converts_the_input_first() {
    let (mut g, x) = to_bool_graph(ElementType::F64);
    g.node_mut(x).unwrap().rt.keep_precision = true;
    convert_precision(&mut g, &base_conversion_map(), &ConvertOptions::default()).unwrap();
    g.validate().unwrap();

    assert_eq!(g.node(x).unwrap().output_type(), Some(ElementType::F64));
    let first = g.consumers(x.into());
    assert_eq!(first.len(), 1);
    assert_eq!(g.node(first[0].node).unwrap().op, OpKind::Convert { destination: ElementType::F32 });

    let out = run(&g, x, ElementType::F64, vec![0.5, 300.0, 0.0]);
    assert_eq!(out.values, vec![1.0, 255.0, 0.0]);
}

#[test]
fn boolean_cast_without_the_rewrite_is_retagged() {
    let (mut g, x) = to_bool_graph(ElementType::F32);
    let opts = ConvertOptions::default().with_fuse_boolean_cast(false);
    let before = g.node_count();
    convert_precision(&mut g, &base_conversion_map(), &opts).unwrap();
    assert_eq!(g.node_count(), before);
    // truncating cast: 0.01 becomes 0 and 256 wraps to 0
    let out = run(&g, x, ElementType::F32, vec![0.01, 256.0, 3.0]);
    assert_eq!(out.values, vec![0.0, 0.0, 3.0]);
}

#[test]
fn boolean_cast_to_a_signed_backend_type_is_retagged() {
    let (mut g, _) = to_bool_graph(ElementType::F32);
    let map = PrecisionMap::from_pairs([(ElementType::Boolean, ElementType::I8)]);
    let stats = convert_precision(&mut g, &map, &ConvertOptions::default()).unwrap();
    assert_eq!(stats.fused_boolean_casts, 0);
    assert_eq!(g.count_op("Ceiling"), 0);
    let cvt = g.nodes().find(|n| n.name == "to_bool").unwrap();
    assert_eq!(cvt.op, OpKind::Convert { destination: ElementType::I8 });
    g.validate().unwrap();
}

/// `x -> FakeQuantize -> Relu -> Result` with constant ranges.
fn fake_quantize_graph() -> (Graph, NodeId, NodeId) {
    let mut g = Graph::new("fq");
    let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[1, 8]));
    let lo = g.add_scalar("lo", ElementType::F32, -1.0).unwrap();
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
    let relu = g.add_node("relu", OpKind::Relu, vec![fq.into()]).unwrap();
    g.add_result("out", relu.into()).unwrap();
    (g, fq, relu)
}

#[test]
fn fake_quantize_keeps_computing_in_f32() {
    let (mut g, fq, relu) = fake_quantize_graph();
    let map = PrecisionMap::from_pairs([(ElementType::F32, ElementType::F16)]);
    let opts = ConvertOptions::default().with_fuse_fake_quantize(true);
    let stats = convert_precision(&mut g, &map, &opts).unwrap();
    g.validate().unwrap();

    assert_eq!(stats.fused_fake_quantize, 1);
    let node = g.node(fq).unwrap();
    assert!(node.rt.keep_precision);
    assert_eq!(node.output_type(), Some(ElementType::F32));
    for port in 0..5 {
        let src = g.producer(InputRef::new(fq, port)).unwrap();
        assert_eq!(g.node(src.node).unwrap().op, OpKind::Convert { destination: ElementType::F32 });
    }
    assert_eq!(g.node(relu).unwrap().output_type(), Some(ElementType::F16));
}

#[test]
fn fake_quantize_without_fusion_is_retagged() {
    let (mut g, fq, _) = fake_quantize_graph();
    let map = PrecisionMap::from_pairs([(ElementType::F32, ElementType::F16)]);
    let stats = convert_precision(&mut g, &map, &ConvertOptions::default()).unwrap();
    assert_eq!(stats.fused_fake_quantize, 0);
    assert_eq!(g.node(fq).unwrap().output_type(), Some(ElementType::F16));
    assert_eq!(g.count_op("Convert"), 0);
}

#[test]
fn fake_quantize_feeding_a_kept_softmax_stays_sound() {
    let mut g = Graph::new("fq_softmax");
    let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[1, 8]));
    let lo = g.add_scalar("lo", ElementType::F32, -1.0).unwrap();
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
    let sm = g.add_node("sm", OpKind::Softmax { axis: -1 }, vec![fq.into()]).unwrap();
    g.add_result("out", sm.into()).unwrap();

    let map = PrecisionMap::from_pairs([(ElementType::F32, ElementType::F16)]);
    let opts = ConvertOptions::default().with_fuse_fake_quantize(true).with_keep_precision_sensitive(true);
    let stats = convert_precision(&mut g, &map, &opts).unwrap();
    g.validate().unwrap();

    assert_eq!(stats.fused_fake_quantize, 1);
    assert_eq!(g.producer(InputRef::new(sm, 0)).unwrap().node, fq);
    assert_eq!(g.node(sm).unwrap().output_type(), Some(ElementType::F32));
    assert_eq!(g.node(x).unwrap().output_type(), Some(ElementType::F16));
}

#[test]
fn second_run_is_a_no_op() {
    let (mut g, _, _) = fake_quantize_graph();
    let map = PrecisionMap::from_pairs([(ElementType::F32, ElementType::F16)]);
    let opts = ConvertOptions::default().with_fuse_fake_quantize(true);
    convert_precision(&mut g, &map, &opts).unwrap();
    let count = g.node_count();
    let second = convert_precision(&mut g, &map, &opts).unwrap();
    assert_eq!(second.inserted_converts, 0);
    assert!(!second.changed());
    assert_eq!(g.node_count(), count);

    let (mut b, _) = to_bool_graph(ElementType::F64);
    convert_precision(&mut b, &base_conversion_map(), &ConvertOptions::default()).unwrap();
    let count = b.node_count();
    let again = convert_precision(&mut b, &base_conversion_map(), &ConvertOptions::default()).unwrap();
    assert!(!again.changed());
    assert_eq!(b.node_count(), count);
}

#[test]
fn kept_decompression_weights_stay_packed() {
    let mut g = Graph::new("decompression");
    let w = g.add_constant("w", ElementType::U4, &[4, 8], vec![3.0]).unwrap();
    g.node_mut(w).unwrap().rt.keep_precision = true;
    let cvt = g.add_node("w/cvt", OpKind::Convert { destination: ElementType::F32 }, vec![w.into()]).unwrap();
    let scale = g.add_constant("w/scale", ElementType::F32, &[4, 1], vec![0.1]).unwrap();
    let mul = g.add_node("w/mul", OpKind::Multiply, vec![cvt.into(), scale.into()]).unwrap();
    let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 8]));
    let mm = g
        .add_node("mm", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![x.into(), mul.into()])
        .unwrap();
    g.add_result("out", mm.into()).unwrap();

    let stats = convert_precision(&mut g, &default_conversion_map(&avx2_report()), &ConvertOptions::default())
        .unwrap();
    assert_eq!(stats.inserted_converts, 0);
    assert_eq!(g.node(w).unwrap().output_type(), Some(ElementType::U4));
    g.validate().unwrap();
}

#[test]
fn unmapped_types_survive() {
    let mut g = Graph::new("i64");
    let x = g.add_parameter("x", ElementType::I64, PartialShape::from_static(&[2]));
    let y = g.add_parameter("y", ElementType::F64, PartialShape::from_static(&[2]));
    g.add_result("x_out", x.into()).unwrap();
    g.add_result("y_out", y.into()).unwrap();
    let map = PrecisionMap::from_pairs([(ElementType::F64, ElementType::F32)]);
    convert_precision(&mut g, &map, &ConvertOptions::default()).unwrap();
    assert_eq!(g.node(x).unwrap().output_type(), Some(ElementType::I64));
    assert_eq!(g.node(y).unwrap().output_type(), Some(ElementType::F32));
}

// ── Type soundness over random graphs ────────────────────────────────

const SOURCE_TYPES: [ElementType; 9] = [
    ElementType::I64,
    ElementType::U64,
    ElementType::I16,
    ElementType::U32,
    ElementType::I32,
    ElementType::F64,
    ElementType::F32,
    ElementType::F16,
    ElementType::Bf16,
];

const OP_COUNT: usize = 6;

fn elementwise(i: usize) -> OpKind {
    match i % OP_COUNT {
        0 => OpKind::Abs,
        1 => OpKind::Relu,
        2 => OpKind::Add,
        3 => OpKind::Multiply,
        4 => OpKind::Maximum,
        _ => OpKind::Minimum,
    }
}

/// A chain of elementwise ops over one parameter and one constant, cast to
/// `destination` at the end.
fn random_graph(ty: ElementType, ops: &[usize], destination: ElementType) -> Graph {
    let mut g = Graph::new("random");
    let x = g.add_parameter("x", ty, PartialShape::from_static(&[2, 3]));
    let c = g.add_constant("c", ty, &[3], vec![1.0, 2.0, 3.0]).unwrap();
    let mut cur = x;
    for (i, op) in ops.iter().enumerate() {
        let op = elementwise(*op);
        let inputs = if op.is_binary_elementwise() { vec![cur.into(), c.into()] } else { vec![cur.into()] };
        cur = g.add_node(format!("op{i}"), op, inputs).unwrap();
    }
    let cvt = g.add_node("cast", OpKind::Convert { destination }, vec![cur.into()]).unwrap();
    g.add_result("out", cvt.into()).unwrap();
    g
}

proptest! {
    #[test]
    fn converted_graphs_only_carry_backend_types(
        ty in prop::sample::select(SOURCE_TYPES.to_vec()),
        ops in prop::collection::vec(0usize..OP_COUNT, 0..6),
        destination in prop::sample::select(
            SOURCE_TYPES.iter().copied().chain([ElementType::Boolean]).collect::<Vec<_>>()
        ),
    ) {
        let mut g = random_graph(ty, &ops, destination);
        let map = default_conversion_map(&avx2_report());
        convert_precision(&mut g, &map, &ConvertOptions::default()).unwrap();
        prop_assert!(g.validate().is_ok());
        for node in g.nodes().filter(|n| !n.rt.keep_precision) {
            for desc in &node.outputs {
                prop_assert!(
                    BACKEND_TYPES.contains(&desc.element_type),
                    "{} carries {}", node, desc.element_type
                );
            }
        }
        let second = convert_precision(&mut g, &map, &ConvertOptions::default()).unwrap();
        prop_assert_eq!(second.inserted_converts, 0);
    }
}
