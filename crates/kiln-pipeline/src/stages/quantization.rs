use super::Gates;
use crate::manager::{Stage, ValidationMode};
use crate::pass::NodePredicate;
use crate::passes::data_movement::move_eltwise_up_through_data_mov;
use crate::passes::low_precision::{PrecisionRestrictions, fold_convert, fuse_convert, quantize_fake_quantize};
use crate::passes::qkv::qkv_projection_fusion;
use crate::passes::simplify::constant_folding;
use kiln_common::{HardwareTier, StageKind};
use kiln_graph::{NodeView, OpKind};
use kiln_patterns::{can_move_eltwise_up, feeds_decompression_multiply, is_decompression_multiply};
use std::sync::Arc;

/// Quantized lowering of FakeQuantize nodes and the converts around them.
///
/// Weight decompression chains are kept out of convert folding and fusing
/// unless low-precision gating is ignored.
pub fn quantization(gates: &Gates) -> Stage {
    let restrictions = PrecisionRestrictions::new(gates.activation_precisions.clone());
    let not_decompression: NodePredicate = Arc::new(|v: &NodeView<'_>| !feeds_decompression_multiply(v));
    let not_decompression_arith: NodePredicate = Arc::new(|v: &NodeView<'_>| {
        let subtract_into_decompression = matches!(v.op(), OpKind::Subtract) && feeds_decompression_multiply(v);
        !is_decompression_multiply(v) && !subtract_into_decompression
    });

    Stage::new(StageKind::Quantization, ValidationMode::Checkpoints)
        .with_pass(quantize_fake_quantize(gates.default_precisions.clone(), restrictions))
        .with_pass(
            fold_convert()
                .with_tier(HardwareTier::X64)
                .with_optional_predicate(gates.optional_lpt_predicate(not_decompression)),
        )
        .with_pass(
            fuse_convert()
                .with_tier(HardwareTier::X64)
                .with_optional_predicate(gates.optional_lpt_predicate(not_decompression_arith)),
        )
        .with_checkpoint()
}

/// Clean-up after quantization, plus the fused QKV projection on targets
/// that run it.
pub fn post_quantization(gates: &Gates) -> Stage {
    let mut stage = Stage::new(StageKind::PostQuantization, ValidationMode::Disabled)
        .with_pass(move_eltwise_up_through_data_mov().with_predicate(can_move_eltwise_up))
        .with_checkpoint()
        .with_pass(constant_folding());
    if gates.run_qkv {
        stage.push_pass(qkv_projection_fusion().with_tier(HardwareTier::X64));
    }
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::tests::{quantized_graph, x64_report};
    use kiln_common::{GatingMode, PipelineConfig};

    #[test]
    fn ignore_gating_drops_optional_predicates() {
        let config = PipelineConfig::default();
        let gates = Gates::derive(&quantized_graph(), &x64_report(&config), &config);
        assert!(quantization(&gates).passes().skip(1).all(|p| p.has_predicate()));

        let config = PipelineConfig { quantization_mode: GatingMode::IgnoreGating, ..PipelineConfig::default() };
        let gates = Gates::derive(&quantized_graph(), &x64_report(&config), &config);
        assert!(quantization(&gates).passes().all(|p| !p.has_predicate()));
    }

    #[test]
    fn qkv_fusion_needs_its_gate() {
        let config = PipelineConfig::default();
        let gates = Gates::derive(&quantized_graph(), &x64_report(&config), &config);
        assert!(!gates.run_qkv);
        assert!(!post_quantization(&gates).pass_labels().contains(&"QkvProjectionFusion"));
    }
}
