use super::Gates;
use crate::manager::{Stage, ValidationMode};
use crate::passes::marking::{keep_const_and_decompression, mark_dequantization_subgraph, mark_shape_of_subgraphs};
use crate::passes::precision::{convert_precision_f16_pass, convert_precision_pass};
use crate::passes::simplify::{eliminate_convert, transpose_matmul};
use kiln_common::{HardwareTier, StageKind};
use kiln_patterns::{DECOMPRESSION_PRECISIONS, has_matmul_consumer, is_decompression_multiply};

/// Shape-subgraph marking and weight-decompression detection.
pub fn pre_quantization(_gates: &Gates) -> Stage {
    Stage::new(StageKind::PreQuantization, ValidationMode::Disabled)
        .with_pass(mark_shape_of_subgraphs())
        .with_pass(transpose_matmul().with_tier(HardwareTier::X64))
        .with_pass(
            mark_dequantization_subgraph(DECOMPRESSION_PRECISIONS.to_vec(), true)
                .with_tier(HardwareTier::X64)
                .with_predicate(is_decompression_multiply),
        )
}

/// Protects activation dequantization chains before type conversion.
pub fn quantization_precision_marking(gates: &Gates) -> Stage {
    Stage::new(StageKind::QuantizationPrecisionMarking, ValidationMode::default())
        .with_pass(mark_dequantization_subgraph(gates.default_precisions.clone(), false))
}

/// Lowers every element type the backend cannot compute in.
pub fn precision_conversion(gates: &Gates) -> Stage {
    let mut stage = Stage::new(StageKind::PrecisionConversion, ValidationMode::Checkpoints);
    if let Some(map) = &gates.f16_map {
        stage.push_pass(convert_precision_f16_pass(map.clone(), gates.f16_fuses_fake_quantize));
    }
    stage
        .with_pass(keep_const_and_decompression().with_predicate(has_matmul_consumer))
        .with_checkpoint()
        .with_pass(convert_precision_pass(gates.conversion_map.clone()))
        .with_pass(eliminate_convert())
        .with_checkpoint()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::tests::x64_report;
    use kiln_common::{ElementType, PipelineConfig};
    use kiln_graph::Graph;

    #[test]
    fn f16_lowering_runs_first_when_requested() {
        let config = PipelineConfig { inference_precision: Some(ElementType::F16), ..PipelineConfig::default() };
        let gates = Gates::derive(&Graph::new("g"), &x64_report(&config), &config);
        let stage = precision_conversion(&gates);
        assert_eq!(stage.pass_labels(), [
            "ConvertPrecisionF16",
            "KeepConstAndDecompression",
            "ConvertPrecision",
            "EliminateConvert"
        ]);
        assert_eq!(stage.checkpoint_count(), 2);
    }

    #[test]
    fn decompression_marking_is_x64_only() {
        let config = PipelineConfig::default();
        let gates = Gates::derive(&Graph::new("g"), &x64_report(&config), &config);
        let stage = pre_quantization(&gates);
        let tiers: Vec<_> = stage.passes().map(|p| p.tier()).collect();
        assert_eq!(tiers, [HardwareTier::Common, HardwareTier::X64, HardwareTier::X64]);
        assert!(stage.passes().last().is_some_and(|p| p.has_predicate()));
    }
}
