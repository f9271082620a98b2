//! Stage controllers.
//!
//! [`Gates`] freezes every decision the pipeline takes from the graph, the
//! capability report and the configuration. Stage builders read only the
//! gates, so which passes run (and under which predicate) is a pure
//! function of those three inputs.

mod fusion;
mod precision;
mod quantization;
mod simplification;

pub use fusion::{kernel_fusion_tokenization, post_fusion};
pub use precision::{pre_quantization, precision_conversion, quantization_precision_marking};
pub use quantization::{post_quantization, quantization};
pub use simplification::structural_simplification;

use crate::manager::Stage;
use crate::pass::NodePredicate;
use kiln_common::{ElementType, GatingMode, IsaFamily, PipelineConfig, StageKind, StageOverride};
use kiln_device_probe::CapabilityReport;
use kiln_graph::Graph;
use kiln_patterns::{
    FusionPolicy, INT8_PRECISIONS, SUPPORTED_FQ_LEVELS, activation_precisions, has_paged_attention,
    is_quantized_model, is_stateful,
};
use kiln_precision::{PrecisionMap, default_conversion_map, f16_fuses_fake_quantize, f16_inference_map};
use std::collections::BTreeMap;

/// Smallest concurrency at which the fused QKV projection pays off.
pub const QKV_MIN_CONCURRENCY: usize = 3;

/// Gate values captured when a pipeline starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Gates {
    pub family: IsaFamily,
    /// Quantization-aware lowering runs.
    pub use_lpt: bool,
    /// Optional low-precision predicates are dropped.
    pub quantization_ignores_gating: bool,
    /// Low precisions the quantization stages may produce; empty without LPT.
    pub default_precisions: Vec<ElementType>,
    /// Precisions a quantized MatMul accepts on its activation input.
    pub activation_precisions: Vec<ElementType>,
    pub fusion: FusionPolicy,
    pub min_fusion_tier: bool,
    pub run_mha: bool,
    pub run_qkv: bool,
    pub stateful: bool,
    pub paged_attention: bool,
    pub conversion_map: PrecisionMap,
    pub f16_map: Option<PrecisionMap>,
    pub f16_fuses_fake_quantize: bool,
    overrides: BTreeMap<StageKind, StageOverride>,
}

impl Gates {
    pub fn derive(graph: &Graph, report: &CapabilityReport, config: &PipelineConfig) -> Self {
        let overrides = config.debug_stage_overrides.clone();
        let lpt_override = overrides.get(&StageKind::Quantization).copied();
        let lpt_requested =
            report.quantization_mode().is_enabled() || lpt_override == Some(StageOverride::ForcedEnabled);
        let use_lpt = lpt_requested
            && lpt_override != Some(StageOverride::ForcedDisabled)
            && is_quantized_model(graph, &SUPPORTED_FQ_LEVELS);

        let fusion = FusionPolicy::from_report(report);
        let paged_attention = has_paged_attention(graph);
        let run_qkv = report.isa_family() == IsaFamily::X64
            && fusion.amx
            && report.inference_precision() == Some(ElementType::Bf16)
            && paged_attention
            && report.concurrency() >= QKV_MIN_CONCURRENCY;

        Self {
            family: report.isa_family(),
            use_lpt,
            quantization_ignores_gating: report.quantization_mode() == GatingMode::IgnoreGating,
            default_precisions: if use_lpt { INT8_PRECISIONS.to_vec() } else { Vec::new() },
            activation_precisions: activation_precisions(report),
            run_mha: fusion.mha_supported(),
            fusion,
            min_fusion_tier: report.has_min_fusion_tier(),
            run_qkv,
            stateful: is_stateful(graph),
            paged_attention,
            conversion_map: default_conversion_map(report),
            f16_map: f16_inference_map(report),
            f16_fuses_fake_quantize: f16_fuses_fake_quantize(report),
            overrides,
        }
    }

    pub fn stage_override(&self, kind: StageKind) -> Option<StageOverride> {
        self.overrides.get(&kind).copied()
    }

    /// Whether `kind` runs at all.
    ///
    /// A forced-disabled stage never runs. A forced-enabled stage bypasses
    /// its configuration flag but still needs the model and the hardware
    /// to qualify.
    pub fn stage_enabled(&self, kind: StageKind) -> bool {
        let forced = self.stage_override(kind);
        if forced == Some(StageOverride::ForcedDisabled) {
            return false;
        }
        match kind {
            StageKind::QuantizationPrecisionMarking | StageKind::Quantization => self.use_lpt,
            StageKind::KernelFusionTokenization | StageKind::PostFusion => {
                (self.fusion.fusion_enabled || forced == Some(StageOverride::ForcedEnabled))
                    && self.min_fusion_tier
            }
            _ => true,
        }
    }

    /// `predicate`, unless low-precision gating is ignored.
    pub(crate) fn optional_lpt_predicate(&self, predicate: NodePredicate) -> Option<NodePredicate> {
        (!self.quantization_ignores_gating).then_some(predicate)
    }

    pub fn summary(&self) -> String {
        format!(
            "family={} lpt={} mha={} qkv={} min_fusion_tier={} stateful={} map={}",
            self.family,
            self.use_lpt,
            self.run_mha,
            self.run_qkv,
            self.min_fusion_tier,
            self.stateful,
            self.conversion_map
        )
    }
}

/// The pass list of `kind`.
pub fn build_stage(kind: StageKind, gates: &Gates) -> Stage {
    match kind {
        StageKind::PreQuantization => pre_quantization(gates),
        StageKind::QuantizationPrecisionMarking => quantization_precision_marking(gates),
        StageKind::PrecisionConversion => precision_conversion(gates),
        StageKind::StructuralSimplification => structural_simplification(gates),
        StageKind::Quantization => quantization(gates),
        StageKind::PostQuantization => post_quantization(gates),
        StageKind::KernelFusionTokenization => kernel_fusion_tokenization(gates),
        StageKind::PostFusion => post_fusion(gates),
    }
}
