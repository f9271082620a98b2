//! Pipeline stage names and debug overrides.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    PreQuantization = 0,
    QuantizationPrecisionMarking = 1,
    PrecisionConversion = 2,
    StructuralSimplification = 3,
    Quantization = 4,
    PostQuantization = 5,
    KernelFusionTokenization = 6,
    PostFusion = 7,
}

impl StageKind {
    /// All stages in the order the pipeline visits them.
    pub const ORDER: [Self; 8] = [
        Self::PreQuantization,
        Self::QuantizationPrecisionMarking,
        Self::PrecisionConversion,
        Self::StructuralSimplification,
        Self::Quantization,
        Self::PostQuantization,
        Self::KernelFusionTokenization,
        Self::PostFusion,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::PreQuantization => "pre_quantization",
            Self::QuantizationPrecisionMarking => "quantization_precision_marking",
            Self::PrecisionConversion => "precision_conversion",
            Self::StructuralSimplification => "structural_simplification",
            Self::Quantization => "quantization",
            Self::PostQuantization => "post_quantization",
            Self::KernelFusionTokenization => "kernel_fusion_tokenization",
            Self::PostFusion => "post_fusion",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Self> {
        Self::ORDER.get(self as usize + 1).copied()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ORDER
            .into_iter()
            .find(|stage| stage.name() == normalized)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Debug override forcing a stage on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOverride {
    /// Run even when the configuration flag for the stage is off.
    /// Model and hardware guards still apply.
    ForcedEnabled,
    /// Never run.
    ForcedDisabled,
}

impl fmt::Display for StageOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedEnabled => write!(f, "forced_enabled"),
            Self::ForcedDisabled => write!(f, "forced_disabled"),
        }
    }
}
