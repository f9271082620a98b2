use super::Gates;
use crate::manager::{Stage, ValidationMode};
use crate::passes::decompose::{
    decompose_integer_divide_pass, group_normalization_decomposition, hard_sigmoid_decomposition,
    sdpa_decomposition, softmax_decomposition,
};
use crate::passes::marking::keep_const_and_decompression;
use crate::passes::simplify::{constant_folding, transpose_matmul};
use kiln_common::{HardwareTier, StageKind};
use kiln_graph::NodeView;
use kiln_patterns::{has_matmul_consumer, keeps_fused_sdpa};

/// Softmax ranks the native kernel does not handle.
pub const MAX_NATIVE_SOFTMAX_RANK: usize = 5;

/// Folding and decomposition of composite operations.
///
/// Group normalization stays fused under quantized lowering, and wherever
/// the fusion policy can tokenize it.
pub fn structural_simplification(gates: &Gates) -> Stage {
    let mut stage = Stage::new(StageKind::StructuralSimplification, ValidationMode::Checkpoints)
        .with_pass(constant_folding())
        .with_pass(softmax_decomposition().with_predicate(|v: &NodeView<'_>| {
            v.input_desc(0).and_then(|d| d.shape.rank()).is_some_and(|r| r > MAX_NATIVE_SOFTMAX_RANK)
        }))
        .with_pass(sdpa_decomposition().with_predicate(|v: &NodeView<'_>| !keeps_fused_sdpa(v)));

    if !gates.use_lpt {
        let policy = gates.fusion.clone();
        stage.push_pass(
            group_normalization_decomposition()
                .with_tier(HardwareTier::X64)
                .with_predicate(move |v: &NodeView<'_>| !policy.is_group_norm_tokenizable(v)),
        );
    }

    stage
        .with_pass(hard_sigmoid_decomposition().with_tier(HardwareTier::Arm64))
        .with_pass(decompose_integer_divide_pass().with_tier(HardwareTier::Arm))
        .with_pass(decompose_integer_divide_pass().with_tier(HardwareTier::X86).with_instance(2))
        .with_checkpoint()
        .with_pass(transpose_matmul())
        .with_pass(keep_const_and_decompression().with_predicate(has_matmul_consumer))
        .with_pass(constant_folding().with_instance(2))
        .with_checkpoint()
}
