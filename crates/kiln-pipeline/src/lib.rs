//! Staged, hardware-gated optimization pipeline for kiln graphs.
//!
//! A [`Pipeline`] runs eight fixed stages over a [`kiln_graph::Graph`]. Each
//! stage is an ordered list of [`Pass`] values and validation checkpoints,
//! built from [`Gates`] that are derived once from the graph, the
//! [`kiln_device_probe::CapabilityReport`] and the
//! [`kiln_common::PipelineConfig`]. The [`PassManager`] executes a stage,
//! skipping passes whose hardware tier does not match the target.
//!
//! ```no_run
//! use kiln_common::{IsaFamily, PipelineConfig};
//! use kiln_device_probe::{CapabilityReport, StaticProbe};
//! use kiln_graph::Graph;
//! use kiln_pipeline::Pipeline;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let report = CapabilityReport::snapshot(&StaticProbe::new(IsaFamily::X64), &config);
//! let mut graph = Graph::new("model");
//! let summary = Pipeline::new(report, config)?.run(&mut graph)?;
//! println!("{}", summary.summary());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod pass;
pub mod passes;
pub mod pipeline;
pub mod stages;

pub use error::{PipelineError, Result, STAGE_ENTRY};
pub use manager::{PassManager, Stage, StageEntry, StageReport, ValidationMode};
pub use pass::{NodePredicate, Pass, Rewrite, Scope};
pub use pipeline::{Pipeline, PipelineReport, StageHook};
pub use stages::{Gates, build_stage};
