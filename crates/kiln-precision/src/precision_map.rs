//! `from -> to` element-type mapping tables.

use kiln_common::ElementType;
use kiln_device_probe::CapabilityReport;
use std::collections::BTreeMap;
use std::fmt;

// ── PrecisionMap ─────────────────────────────────────────────────────

/// A `from -> to` element-type mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecisionMap {
    entries: BTreeMap<ElementType, ElementType>,
}

impl PrecisionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ElementType, ElementType)>) -> Self {
        Self { entries: pairs.into_iter().collect() }
    }

    /// Add or replace one mapping. Identity mappings are ignored.
    pub fn insert(&mut self, from: ElementType, to: ElementType) {
        if from != to {
            self.entries.insert(from, to);
        }
    }

    #[must_use]
    pub fn get(&self, from: ElementType) -> Option<ElementType> {
        self.entries.get(&from).copied()
    }

    #[must_use]
    pub fn contains(&self, from: ElementType) -> bool {
        self.entries.contains_key(&from)
    }

    /// `ty` mapped once, or `ty` itself when unmapped.
    #[must_use]
    pub fn resolve(&self, ty: ElementType) -> ElementType {
        self.get(ty).unwrap_or(ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ElementType, ElementType)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for PrecisionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(from, to)| format!("{from}->{to}")).collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

// ── Backend maps ─────────────────────────────────────────────────────

/// Types the CPU backend never computes in, with their replacements.
#[must_use]
pub fn base_conversion_map() -> PrecisionMap {
    use ElementType::*;
    PrecisionMap::from_pairs([
        (I64, I32),
        (U64, I32),
        (I16, I32),
        (U16, I32),
        (U32, I32),
        (F64, F32),
        (Boolean, U8),
        (I4, I8),
        (U4, U8),
    ])
}

/// The main conversion map for a target.
///
/// Extends [`base_conversion_map`] with `bf16 -> f32` when the target lacks
/// bf16 arithmetic and `f16 -> f32` unless f16 inference was requested (or
/// left unspecified) on hardware with f16 arithmetic.
#[must_use]
pub fn default_conversion_map(report: &CapabilityReport) -> PrecisionMap {
    let mut map = base_conversion_map();
    if !report.has_hardware_support(ElementType::Bf16) {
        map.insert(ElementType::Bf16, ElementType::F32);
    }
    let f16_requested = matches!(report.inference_precision(), None | Some(ElementType::F16));
    if !f16_requested || !report.has_hardware_support(ElementType::F16) {
        map.insert(ElementType::F16, ElementType::F32);
    }
    map
}

/// The extra map that lowers f32 compute to f16, when f16 inference was
/// requested.
#[must_use]
pub fn f16_inference_map(report: &CapabilityReport) -> Option<PrecisionMap> {
    (report.inference_precision() == Some(ElementType::F16))
        .then(|| PrecisionMap::from_pairs([(ElementType::F32, ElementType::F16)]))
}

/// FakeQuantize nodes keep computing in f32 under f16 inference on Arm.
#[must_use]
pub fn f16_fuses_fake_quantize(report: &CapabilityReport) -> bool {
    report.isa_family().is_arm_family()
}

/// Element types the backend accepts on any output after conversion with
/// the default map. Sub-byte types only survive on kept weight constants.
pub const BACKEND_TYPES: [ElementType; 9] = [
    ElementType::U8,
    ElementType::I8,
    ElementType::U4,
    ElementType::I4,
    ElementType::Nf4,
    ElementType::I32,
    ElementType::F32,
    ElementType::Bf16,
    ElementType::F16,
];

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::{CpuFeature, IsaFamily, PipelineConfig};
    use kiln_device_probe::StaticProbe;

    fn report(family: IsaFamily, features: &[CpuFeature], precision: Option<ElementType>) -> CapabilityReport {
        let probe = StaticProbe::new(family).with_features(features.iter().copied());
        let config = PipelineConfig { inference_precision: precision, ..PipelineConfig::default() };
        CapabilityReport::snapshot(&probe, &config)
    }

    #[test]
    fn base_map_narrows_wide_integers() {
        let map = base_conversion_map();
        assert_eq!(map.get(ElementType::I64), Some(ElementType::I32));
        assert_eq!(map.get(ElementType::Boolean), Some(ElementType::U8));
        assert_eq!(map.get(ElementType::F32), None);
        assert_eq!(map.len(), 9);
    }

    #[test]
    fn bf16_is_kept_with_hardware_support() {
        let plain = default_conversion_map(&report(IsaFamily::X64, &[CpuFeature::Avx2], None));
        assert_eq!(plain.get(ElementType::Bf16), Some(ElementType::F32));
        let amx = default_conversion_map(&report(IsaFamily::X64, &[CpuFeature::Amx], None));
        assert_eq!(amx.get(ElementType::Bf16), None);
    }

    #[test]
    fn f16_kept_only_when_requested_and_supported() {
        let arm = [CpuFeature::Asimd, CpuFeature::Fp16Arith];
        let requested = default_conversion_map(&report(IsaFamily::Arm64, &arm, Some(ElementType::F16)));
        assert!(!requested.contains(ElementType::F16));
        let f32_mode = default_conversion_map(&report(IsaFamily::Arm64, &arm, Some(ElementType::F32)));
        assert_eq!(f32_mode.get(ElementType::F16), Some(ElementType::F32));
        let no_hw = default_conversion_map(&report(IsaFamily::Arm64, &[CpuFeature::Asimd], None));
        assert_eq!(no_hw.get(ElementType::F16), Some(ElementType::F32));
    }

    #[test]
    fn f16_inference_adds_f32_lowering() {
        let r = report(IsaFamily::Arm64, &[CpuFeature::Fp16Arith], Some(ElementType::F16));
        assert_eq!(f16_inference_map(&r).unwrap().get(ElementType::F32), Some(ElementType::F16));
        assert!(f16_fuses_fake_quantize(&r));
        assert!(f16_inference_map(&report(IsaFamily::X64, &[], None)).is_none());
    }

    #[test]
    fn identity_insert_is_ignored() {
        let mut map = PrecisionMap::new();
        map.insert(ElementType::F32, ElementType::F32);
        assert!(map.is_empty());
        map.insert(ElementType::F64, ElementType::F32);
        assert_eq!(map.to_string(), "{f64->f32}");
    }
}
