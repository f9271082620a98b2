//! Shared helpers for pipeline integration tests.
#![allow(dead_code)]

use kiln_common::{CpuFeature, ElementType, IsaFamily, PipelineConfig};
use kiln_device_probe::{CapabilityReport, StaticProbe};
use kiln_graph::{Graph, NodeId, OpKind, PartialShape};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Route `tracing` output through the test harness. Safe to call from
/// every test.
pub fn setup_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=debug")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn x64_avx512() -> StaticProbe {
    StaticProbe::new(IsaFamily::X64)
        .with_features([CpuFeature::Sse42, CpuFeature::Avx2, CpuFeature::Avx512Core, CpuFeature::Avx512CoreVnni])
        .with_threads(8)
}

pub fn arm64_neon() -> StaticProbe {
    StaticProbe::new(IsaFamily::Arm64).with_features([CpuFeature::Asimd]).with_threads(4)
}

pub fn report(probe: &StaticProbe, config: &PipelineConfig) -> CapabilityReport {
    CapabilityReport::snapshot(probe, config)
}

/// `x(f32) -> FakeQuantize(256) -> MatMul(w) -> Relu -> Result`.
pub fn quantized_matmul() -> Graph {
    let mut g = Graph::new("quantized_matmul");
    let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[1, 4, 16]));
    let lo = g.add_scalar("fq/lo", ElementType::F32, 0.0).unwrap();
    let hi = g.add_scalar("fq/hi", ElementType::F32, 2.55).unwrap();
    let fq = g
        .add_node("fq", OpKind::FakeQuantize { levels: 256 }, vec![x.into(), lo.into(), hi.into(), lo.into(), hi.into()])
        .unwrap();
    let w = g.add_constant("w", ElementType::F32, &[8, 16], vec![0.25]).unwrap();
    let mm = g
        .add_node("mm", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![fq.into(), w.into()])
        .unwrap();
    let relu = g.add_node("relu", OpKind::Relu, vec![mm.into()]).unwrap();
    g.add_result("out", relu.into()).unwrap();
    g
}

/// An f32 model with i64 index math, a boolean cast and an f64 branch.
pub fn mixed_precision() -> Graph {
    let mut g = Graph::new("mixed_precision");
    let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2, 8]));
    let ids = g.add_parameter("ids", ElementType::I64, PartialShape::from_static(&[2, 8]));
    let one = g.add_scalar("one", ElementType::I64, 1.0).unwrap();
    let shifted = g.add_node("shifted", OpKind::Add, vec![ids.into(), one.into()]).unwrap();
    let mask = g.add_node("mask", OpKind::Convert { destination: ElementType::Boolean }, vec![x.into()]).unwrap();
    let wide = g.add_node("wide", OpKind::Convert { destination: ElementType::F64 }, vec![x.into()]).unwrap();
    let sq = g.add_node("sq", OpKind::Sqrt, vec![wide.into()]).unwrap();
    let soft = g.add_node("soft", OpKind::Softmax { axis: -1 }, vec![x.into()]).unwrap();
    g.add_result("shifted_out", shifted.into()).unwrap();
    g.add_result("mask_out", mask.into()).unwrap();
    g.add_result("sq_out", sq.into()).unwrap();
    g.add_result("soft_out", soft.into()).unwrap();
    g
}

/// `q·kᵀ -> Softmax -> ·v` attention block on static shapes.
pub fn attention_block() -> (Graph, NodeId) {
    let mut g = Graph::new("attention");
    let shape = PartialShape::from_static(&[2, 4, 64, 32]);
    let q = g.add_parameter("q", ElementType::F32, shape.clone());
    let k = g.add_parameter("k", ElementType::F32, shape.clone());
    let v = g.add_parameter("v", ElementType::F32, shape);
    let qk = g
        .add_node("qk", OpKind::MatMul { transpose_a: false, transpose_b: true }, vec![q.into(), k.into()])
        .unwrap();
    let sm = g.add_node("sm", OpKind::Softmax { axis: -1 }, vec![qk.into()]).unwrap();
    let out = g
        .add_node("attn", OpKind::MatMul { transpose_a: false, transpose_b: false }, vec![sm.into(), v.into()])
        .unwrap();
    g.add_result("out", out.into()).unwrap();
    (g, qk)
}
