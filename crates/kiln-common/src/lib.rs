//! Common types for the kiln graph optimization pipeline.
//!
//! This crate provides the vocabulary shared by every other kiln crate:
//! tensor element types, CPU feature tiers and pass hardware tags, stage
//! names, and the pipeline configuration record.

pub mod config;
pub mod element_type;
pub mod isa;
pub mod stage;

pub use config::{ConfigError, GatingMode, PipelineConfig};
pub use element_type::ElementType;
pub use isa::{CpuFeature, HardwareTier, IsaFamily};
pub use stage::{StageKind, StageOverride};
