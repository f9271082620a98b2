//! Tensor element types.
//!
//! [`ElementType`] is the closed set of scalar kinds a graph output may carry,
//! including the sub-byte packed kinds used by weight compression.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Boolean,
    U4,
    I4,
    /// 4-bit normal-float lookup type.
    Nf4,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl ElementType {
    /// Every element type, narrowest first.
    pub const ALL: [Self; 16] = [
        Self::Boolean,
        Self::U4,
        Self::I4,
        Self::Nf4,
        Self::U8,
        Self::I8,
        Self::U16,
        Self::I16,
        Self::U32,
        Self::I32,
        Self::U64,
        Self::I64,
        Self::F16,
        Self::Bf16,
        Self::F32,
        Self::F64,
    ];

    /// Width of one element in bits.
    pub const fn bitwidth(self) -> u32 {
        match self {
            Self::Boolean | Self::U8 | Self::I8 => 8,
            Self::U4 | Self::I4 | Self::Nf4 => 4,
            Self::U16 | Self::I16 | Self::F16 | Self::Bf16 => 16,
            Self::U32 | Self::I32 | Self::F32 => 32,
            Self::U64 | Self::I64 | Self::F64 => 64,
        }
    }

    /// Storage size of one element, rounded up to whole bytes.
    pub const fn size_in_bytes(self) -> usize {
        (self.bitwidth() as usize).div_ceil(8)
    }

    /// Floating-point kinds (`nf4` is a lookup code, not arithmetic).
    pub const fn is_real(self) -> bool {
        matches!(self, Self::F16 | Self::Bf16 | Self::F32 | Self::F64)
    }

    /// Integer kinds, excluding `boolean` and `nf4`.
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::U4
                | Self::I4
                | Self::U8
                | Self::I8
                | Self::U16
                | Self::I16
                | Self::U32
                | Self::I32
                | Self::U64
                | Self::I64
        )
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I4
                | Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::F16
                | Self::Bf16
                | Self::F32
                | Self::F64
                | Self::Nf4
        )
    }

    /// Packed kinds that store more than one element per byte.
    pub const fn is_sub_byte(self) -> bool {
        self.bitwidth() < 8
    }

    /// Largest finite value representable by this type.
    pub fn max_value(self) -> f64 {
        match self {
            Self::Boolean => 1.0,
            Self::U4 => 15.0,
            Self::I4 => 7.0,
            Self::Nf4 => 1.0,
            Self::U8 => f64::from(u8::MAX),
            Self::I8 => f64::from(i8::MAX),
            Self::U16 => f64::from(u16::MAX),
            Self::I16 => f64::from(i16::MAX),
            Self::U32 => f64::from(u32::MAX),
            Self::I32 => f64::from(i32::MAX),
            Self::U64 => u64::MAX as f64,
            Self::I64 => i64::MAX as f64,
            Self::F16 => half::f16::MAX.to_f64(),
            Self::Bf16 => half::bf16::MAX.to_f64(),
            Self::F32 => f64::from(f32::MAX),
            Self::F64 => f64::MAX,
        }
    }

    /// Smallest finite value representable by this type.
    pub fn min_value(self) -> f64 {
        match self {
            Self::Boolean | Self::U4 | Self::U8 | Self::U16 | Self::U32 | Self::U64 => 0.0,
            Self::I4 => -8.0,
            Self::Nf4 => -1.0,
            Self::I8 => f64::from(i8::MIN),
            Self::I16 => f64::from(i16::MIN),
            Self::I32 => f64::from(i32::MIN),
            Self::I64 => i64::MIN as f64,
            Self::F16 => half::f16::MIN.to_f64(),
            Self::Bf16 => half::bf16::MIN.to_f64(),
            Self::F32 => f64::from(f32::MIN),
            Self::F64 => f64::MIN,
        }
    }

    /// Lowercase short name (`"f32"`, `"boolean"`, ...).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::U4 => "u4",
            Self::I4 => "i4",
            Self::Nf4 => "nf4",
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ElementType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "bool" => return Ok(Self::Boolean),
            "fp16" => return Ok(Self::F16),
            "fp32" => return Ok(Self::F32),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .ok_or_else(|| format!("unknown element type: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_for_packed_types() {
        assert_eq!(ElementType::U4.size_in_bytes(), 1);
        assert_eq!(ElementType::Nf4.size_in_bytes(), 1);
        assert_eq!(ElementType::Bf16.size_in_bytes(), 2);
        assert_eq!(ElementType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn classification() {
        assert!(ElementType::Bf16.is_real());
        assert!(!ElementType::Boolean.is_integral());
        assert!(!ElementType::Nf4.is_integral());
        assert!(ElementType::U8.is_integral());
        assert!(!ElementType::U8.is_signed());
        assert!(ElementType::I4.is_sub_byte());
    }

    #[test]
    fn max_values() {
        assert_eq!(ElementType::U8.max_value(), 255.0);
        assert_eq!(ElementType::I4.max_value(), 7.0);
        assert_eq!(ElementType::F16.max_value(), 65504.0);
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!("bool".parse::<ElementType>(), Ok(ElementType::Boolean));
        assert_eq!("FP16".parse::<ElementType>(), Ok(ElementType::F16));
        assert_eq!("bf16".parse::<ElementType>(), Ok(ElementType::Bf16));
        assert!("f8".parse::<ElementType>().is_err());
    }

    #[test]
    fn display_parses_back() {
        for t in ElementType::ALL {
            assert_eq!(t.to_string().parse::<ElementType>(), Ok(t));
        }
    }
}
