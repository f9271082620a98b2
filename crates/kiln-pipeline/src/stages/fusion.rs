use super::Gates;
use crate::manager::{Stage, ValidationMode};
use crate::passes::decompose::fake_quantize_decomposition;
use crate::passes::simplify::constant_folding;
use crate::passes::tokenize::{snippets_mark_skipped, tokenize_mha, tokenize_snippets};
use kiln_common::{HardwareTier, StageKind};
use kiln_graph::NodeView;
use kiln_patterns::is_supported_fake_quantize;

/// Groups nodes into fused kernel regions.
///
/// Region size is bounded by the data-pointer registers of the target.
pub fn kernel_fusion_tokenization(gates: &Gates) -> Stage {
    let mut stage = Stage::new(StageKind::KernelFusionTokenization, ValidationMode::Disabled);
    if !gates.fusion.ignore_gating {
        stage.push_pass(snippets_mark_skipped());
    }
    if gates.run_mha {
        let policy = gates.fusion.clone();
        stage.push_pass(
            tokenize_mha()
                .with_tier(HardwareTier::X64)
                .with_predicate(move |v: &NodeView<'_>| policy.is_mha_tokenizable(v)),
        );
    }
    let policy = gates.fusion.clone();
    stage.with_pass(
        tokenize_snippets(gates.fusion.data_ptr_gpr_count())
            .with_predicate(move |v: &NodeView<'_>| policy.is_tokenizable(v)),
    )
}

/// Decomposes FakeQuantize nodes the backend cannot run natively.
pub fn post_fusion(_gates: &Gates) -> Stage {
    Stage::new(StageKind::PostFusion, ValidationMode::Checkpoints)
        .with_pass(fake_quantize_decomposition().with_predicate(|v: &NodeView<'_>| !is_supported_fake_quantize(v)))
        .with_pass(constant_folding())
        .with_checkpoint()
}
