//! Instruction-set families, CPU feature tiers, and pass hardware tags.
//!
//! Pass gating is data-driven: a [`HardwareTier`] tag on a pass is checked
//! against the [`IsaFamily`] recorded in the capability report rather than
//! selected with `#[cfg]` at build time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Instruction-set family of the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsaFamily {
    /// 64-bit x86.
    X64,
    /// 32-bit x86.
    X86,
    /// 64-bit Arm.
    Arm64,
    /// 32-bit Arm.
    Arm32,
    /// Anything else; only untagged passes run.
    Other,
}

impl IsaFamily {
    /// Family of the machine this binary was built for.
    pub const fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::X64
        } else if cfg!(target_arch = "x86") {
            Self::X86
        } else if cfg!(target_arch = "aarch64") {
            Self::Arm64
        } else if cfg!(target_arch = "arm") {
            Self::Arm32
        } else {
            Self::Other
        }
    }

    pub const fn is_x86_family(self) -> bool {
        matches!(self, Self::X64 | Self::X86)
    }

    pub const fn is_arm_family(self) -> bool {
        matches!(self, Self::Arm64 | Self::Arm32)
    }
}

impl fmt::Display for IsaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X64 => write!(f, "x64"),
            Self::X86 => write!(f, "x86"),
            Self::Arm64 => write!(f, "arm64"),
            Self::Arm32 => write!(f, "arm32"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for IsaFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x64" | "x86_64" => Ok(Self::X64),
            "x86" => Ok(Self::X86),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "arm32" | "arm" => Ok(Self::Arm32),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown ISA family: {other}")),
        }
    }
}

/// CPU feature tier reported by the capability probe.
///
/// Variants are declared in ascending capability order within each family,
/// so the derived `Ord` ranks them; sorting descending yields the
/// most-capable-first list carried by the capability report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CpuFeature {
    /// Arm Advanced SIMD (NEON).
    Asimd,
    /// Arm half-precision vector arithmetic.
    Fp16Arith,
    /// Arm Scalable Vector Extension.
    Sve,
    /// x86 SSE4.2.
    Sse42,
    /// x86 AVX2 (256-bit).
    Avx2,
    /// AVX-VNNI int8 dot products on 256-bit vectors.
    Avx2Vnni,
    /// AVX-VNNI-INT8 (signed/unsigned int8 pairs on 256-bit vectors).
    Avx2Vnni2,
    /// AVX-512 F/BW/VL/DQ.
    Avx512Core,
    /// AVX-512 VNNI.
    Avx512CoreVnni,
    /// AVX-512 BF16.
    Avx512CoreBf16,
    /// AVX-512 FP16.
    Avx512CoreFp16,
    /// AMX tiles with int8 and bf16 matrix multiply.
    Amx,
    /// AMX tiles with fp16 matrix multiply.
    AmxFp16,
}

impl CpuFeature {
    pub const ALL: [Self; 13] = [
        Self::Asimd,
        Self::Fp16Arith,
        Self::Sve,
        Self::Sse42,
        Self::Avx2,
        Self::Avx2Vnni,
        Self::Avx2Vnni2,
        Self::Avx512Core,
        Self::Avx512CoreVnni,
        Self::Avx512CoreBf16,
        Self::Avx512CoreFp16,
        Self::Amx,
        Self::AmxFp16,
    ];

    /// Family this feature belongs to.
    pub const fn is_x86(self) -> bool {
        !matches!(self, Self::Asimd | Self::Fp16Arith | Self::Sve)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Asimd => "asimd",
            Self::Fp16Arith => "fp16",
            Self::Sve => "sve",
            Self::Sse42 => "sse4.2",
            Self::Avx2 => "avx2",
            Self::Avx2Vnni => "avx2_vnni",
            Self::Avx2Vnni2 => "avx2_vnni_2",
            Self::Avx512Core => "avx512_core",
            Self::Avx512CoreVnni => "avx512_core_vnni",
            Self::Avx512CoreBf16 => "avx512_core_bf16",
            Self::Avx512CoreFp16 => "avx512_core_fp16",
            Self::Amx => "avx512_core_amx",
            Self::AmxFp16 => "avx512_core_amx_fp16",
        }
    }
}

impl fmt::Display for CpuFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CpuFeature {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "neon" => return Ok(Self::Asimd),
            "amx" => return Ok(Self::Amx),
            "amx_fp16" => return Ok(Self::AmxFp16),
            "sse42" => return Ok(Self::Sse42),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|feat| feat.name() == lower)
            .ok_or_else(|| format!("unknown CPU feature: {s}"))
    }
}

/// Hardware restriction carried by a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HardwareTier {
    /// Runs on every family.
    #[default]
    Common,
    /// 64-bit x86 only.
    X64,
    /// 32-bit x86 only.
    X86,
    /// Any Arm family.
    Arm,
    /// 64-bit Arm only.
    Arm64,
    /// 32-bit Arm only.
    Arm32,
}

impl HardwareTier {
    /// Whether a pass with this tag runs on `family`.
    pub const fn matches(self, family: IsaFamily) -> bool {
        match self {
            Self::Common => true,
            Self::X64 => matches!(family, IsaFamily::X64),
            Self::X86 => matches!(family, IsaFamily::X86),
            Self::Arm => family.is_arm_family(),
            Self::Arm64 => matches!(family, IsaFamily::Arm64),
            Self::Arm32 => matches!(family, IsaFamily::Arm32),
        }
    }
}

impl fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Common => write!(f, "common"),
            Self::X64 => write!(f, "x64"),
            Self::X86 => write!(f, "x86"),
            Self::Arm => write!(f, "arm"),
            Self::Arm64 => write!(f, "arm64"),
            Self::Arm32 => write!(f, "arm32"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_tier_matches_everything() {
        for family in
            [IsaFamily::X64, IsaFamily::X86, IsaFamily::Arm64, IsaFamily::Arm32, IsaFamily::Other]
        {
            assert!(HardwareTier::Common.matches(family));
        }
    }

    #[test]
    fn arm_tier_covers_both_widths() {
        assert!(HardwareTier::Arm.matches(IsaFamily::Arm64));
        assert!(HardwareTier::Arm.matches(IsaFamily::Arm32));
        assert!(!HardwareTier::Arm.matches(IsaFamily::X64));
        assert!(!HardwareTier::Arm64.matches(IsaFamily::Arm32));
    }

    #[test]
    fn x64_and_x86_are_distinct() {
        assert!(HardwareTier::X64.matches(IsaFamily::X64));
        assert!(!HardwareTier::X64.matches(IsaFamily::X86));
        assert!(HardwareTier::X86.matches(IsaFamily::X86));
    }

    #[test]
    fn feature_ordering_ranks_wider_higher() {
        assert!(CpuFeature::Amx > CpuFeature::Avx512Core);
        assert!(CpuFeature::Avx512Core > CpuFeature::Avx2);
        assert!(CpuFeature::Avx2 > CpuFeature::Sse42);
    }

    #[test]
    fn feature_names_parse_back() {
        for feat in CpuFeature::ALL {
            assert_eq!(feat.name().parse::<CpuFeature>(), Ok(feat));
        }
        assert_eq!("neon".parse::<CpuFeature>(), Ok(CpuFeature::Asimd));
    }
}
