//! Element-type conversion for kiln graphs.
//!
//! The CPU backend computes in a small set of element types. This crate holds
//! the `from -> to` maps chosen from a [`kiln_device_probe::CapabilityReport`]
//! and the engine that rewrites a [`kiln_graph::Graph`] through one of them.

pub mod convert;
pub mod fuse;
pub mod precision_map;

pub use convert::{ConversionStats, ConvertOptions, PRECISION_SENSITIVE_OPS, convert_precision};
pub use fuse::{fuse_boolean_cast, fuse_fake_quantize, needs_boolean_rewrite};
pub use precision_map::{
    BACKEND_TYPES, PrecisionMap, base_conversion_map, default_conversion_map,
    f16_fuses_fake_quantize, f16_inference_map,
};
