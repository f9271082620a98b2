//! The top-level pipeline: every stage in order, gated by [`Gates`].

use crate::error::Result;
use crate::manager::{PassManager, Stage, StageReport, ValidationMode};
use crate::stages::{Gates, build_stage};
use kiln_common::{PipelineConfig, StageKind};
use kiln_device_probe::CapabilityReport;
use kiln_graph::Graph;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Callback that may edit a stage after it is built and before it runs.
pub type StageHook = Arc<dyn Fn(&mut Stage) + Send + Sync>;

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Reports of the stages that ran, in order.
    pub ran: Vec<StageReport>,
    /// Stages whose gate was closed.
    pub skipped: Vec<StageKind>,
}

impl PipelineReport {
    pub fn stage(&self, kind: StageKind) -> Option<&StageReport> {
        self.ran.iter().find(|r| r.stage == Some(kind))
    }

    /// Whether `pass` ran in any stage.
    pub fn executed(&self, pass: &str) -> bool {
        self.ran.iter().any(|r| r.ran(pass))
    }

    pub fn summary(&self) -> String {
        let ran: Vec<&str> = self.ran.iter().filter_map(|r| r.stage).map(StageKind::name).collect();
        let skipped: Vec<&str> = self.skipped.iter().map(|k| k.name()).collect();
        format!("ran=[{}] skipped=[{}]", ran.join(","), skipped.join(","))
    }
}

/// Runs the eight optimization stages against a graph.
pub struct Pipeline {
    report: CapabilityReport,
    config: PipelineConfig,
    validation: Option<ValidationMode>,
    hooks: Vec<StageHook>,
}

impl Pipeline {
    /// Fails when `config` does not validate.
    pub fn new(report: CapabilityReport, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { report, config, validation: None, hooks: Vec::new() })
    }

    /// Use `mode` in every stage instead of each stage's own mode.
    #[must_use]
    pub const fn with_validation(mut self, mode: ValidationMode) -> Self {
        self.validation = Some(mode);
        self
    }

    /// Run `hook` on every stage after it is built.
    #[must_use]
    pub fn with_stage_hook(mut self, hook: impl Fn(&mut Stage) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub const fn report(&self) -> &CapabilityReport {
        &self.report
    }

    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gates(&self, graph: &Graph) -> Gates {
        Gates::derive(graph, &self.report, &self.config)
    }

    /// Every stage as it would run on `graph`, closed gates included.
    pub fn stages(&self, graph: &Graph) -> Vec<Stage> {
        let gates = self.gates(graph);
        StageKind::ORDER.into_iter().map(|kind| self.prepare(kind, &gates)).collect()
    }

    fn prepare(&self, kind: StageKind, gates: &Gates) -> Stage {
        let mut stage = build_stage(kind, gates);
        if let Some(mode) = self.validation {
            stage.set_validation(mode);
        }
        for hook in &self.hooks {
            hook(&mut stage);
        }
        stage
    }

    /// Rewrite `graph` in place.
    ///
    /// Gates are derived once from the graph as it is on entry. The first
    /// error aborts the run and leaves the graph as the failing pass left it.
    pub fn run(&self, graph: &mut Graph) -> Result<PipelineReport> {
        let gates = self.gates(graph);
        info!(graph = graph.name(), gates = %gates.summary(), "pipeline start");
        let manager = PassManager::from_report(&self.report, &self.config);

        let mut report = PipelineReport::default();
        for kind in StageKind::ORDER {
            if !gates.stage_enabled(kind) {
                info!(stage = %kind, "stage skipped");
                report.skipped.push(kind);
                continue;
            }
            let stage = self.prepare(kind, &gates);
            report.ran.push(manager.run(&stage, graph)?);
        }
        info!(graph = graph.name(), report = %report.summary(), "pipeline done");
        Ok(report)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("report", &self.report)
            .field("config", &self.config)
            .field("validation", &self.validation)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
