//! Ordered execution of one stage's passes.

use crate::error::{PipelineError, Result, STAGE_ENTRY};
use crate::pass::Pass;
use kiln_common::{IsaFamily, PipelineConfig, StageKind};
use kiln_device_probe::CapabilityReport;
use kiln_graph::{Graph, GraphError};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, error, info};

// ── Stage description ────────────────────────────────────────────────

/// When a stage checks that the graph is well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValidationMode {
    /// Checkpoints are skipped.
    Disabled,
    /// Only explicit checkpoints run.
    #[default]
    Checkpoints,
    /// Explicit checkpoints plus one after every executed pass.
    PerPass,
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Checkpoints => write!(f, "checkpoints"),
            Self::PerPass => write!(f, "per_pass"),
        }
    }
}

#[derive(Debug)]
pub enum StageEntry {
    Pass(Pass),
    Checkpoint,
}

/// An ordered list of passes and validation checkpoints.
#[derive(Debug)]
pub struct Stage {
    kind: StageKind,
    validation: ValidationMode,
    entries: Vec<StageEntry>,
}

impl Stage {
    pub const fn new(kind: StageKind, validation: ValidationMode) -> Self {
        Self { kind, validation, entries: Vec::new() }
    }

    #[must_use]
    pub fn with_pass(mut self, pass: Pass) -> Self {
        self.entries.push(StageEntry::Pass(pass));
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self) -> Self {
        self.entries.push(StageEntry::Checkpoint);
        self
    }

    pub fn push_pass(&mut self, pass: Pass) {
        self.entries.push(StageEntry::Pass(pass));
    }

    pub fn push_checkpoint(&mut self) {
        self.entries.push(StageEntry::Checkpoint);
    }

    pub const fn kind(&self) -> StageKind {
        self.kind
    }

    pub const fn validation(&self) -> ValidationMode {
        self.validation
    }

    pub fn set_validation(&mut self, mode: ValidationMode) {
        self.validation = mode;
    }

    pub fn entries(&self) -> &[StageEntry] {
        &self.entries
    }

    /// Registered passes in order.
    pub fn passes(&self) -> impl Iterator<Item = &Pass> {
        self.entries.iter().filter_map(|e| match e {
            StageEntry::Pass(p) => Some(p),
            StageEntry::Checkpoint => None,
        })
    }

    /// Registered pass labels in order.
    pub fn pass_labels(&self) -> Vec<&str> {
        self.passes().map(Pass::label).collect()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.entries.iter().filter(|e| matches!(e, StageEntry::Checkpoint)).count()
    }
}

// ── Stage report ─────────────────────────────────────────────────────

/// What happened while running one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Option<StageKind>,
    /// Passes that ran, in order.
    pub executed: Vec<String>,
    /// Passes whose hardware tier did not match the target.
    pub skipped_by_tier: Vec<String>,
    /// Passes disabled by configuration.
    pub skipped_by_config: Vec<String>,
    /// Executed passes that modified the graph.
    pub changed: Vec<String>,
    /// Validation checkpoints that ran.
    pub checkpoints: usize,
}

impl StageReport {
    pub fn ran(&self, pass: &str) -> bool {
        self.executed.iter().any(|p| p == pass)
    }

    pub fn summary(&self) -> String {
        format!(
            "executed={} changed={} skipped_tier={} skipped_config={} checkpoints={}",
            self.executed.len(),
            self.changed.len(),
            self.skipped_by_tier.len(),
            self.skipped_by_config.len(),
            self.checkpoints
        )
    }
}

// ── Manager ──────────────────────────────────────────────────────────

/// Runs stages against a graph.
///
/// Holds only the target ISA family and the disabled-pass list; everything
/// else a pass needs was captured when the stage was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassManager {
    family: IsaFamily,
    disabled_passes: BTreeSet<String>,
}

impl PassManager {
    pub const fn new(family: IsaFamily) -> Self {
        Self { family, disabled_passes: BTreeSet::new() }
    }

    pub fn from_report(report: &CapabilityReport, config: &PipelineConfig) -> Self {
        Self { family: report.isa_family(), disabled_passes: config.disabled_passes.clone() }
    }

    #[must_use]
    pub fn with_disabled_passes(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.disabled_passes.extend(names.into_iter().map(Into::into));
        self
    }

    pub const fn family(&self) -> IsaFamily {
        self.family
    }

    /// Execute `stage` in registration order.
    ///
    /// A failing checkpoint aborts the stage with
    /// [`PipelineError::Validation`] naming the last executed pass and every
    /// pass executed since the previous checkpoint.
    pub fn run(&self, stage: &Stage, graph: &mut Graph) -> Result<StageReport> {
        let kind = stage.kind();
        check_unique_names(stage)?;
        info!(stage = %kind, validation = %stage.validation(), "stage start");

        let mut report = StageReport { stage: Some(kind), ..StageReport::default() };
        let mut last_pass: Option<&str> = None;
        let mut since_checkpoint: Vec<&str> = Vec::new();

        for entry in stage.entries() {
            match entry {
                StageEntry::Checkpoint => {
                    if stage.validation() != ValidationMode::Disabled {
                        checkpoint(kind, last_pass, &since_checkpoint, graph)?;
                        since_checkpoint.clear();
                        report.checkpoints += 1;
                    }
                }
                StageEntry::Pass(pass) => {
                    let name = pass.label();
                    if !pass.tier().matches(self.family) {
                        debug!(stage = %kind, pass = name, tier = %pass.tier(), "pass skipped by tier");
                        report.skipped_by_tier.push(name.to_owned());
                        continue;
                    }
                    if self.disabled_passes.contains(pass.name()) || self.disabled_passes.contains(name) {
                        debug!(stage = %kind, pass = name, "pass disabled by configuration");
                        report.skipped_by_config.push(name.to_owned());
                        continue;
                    }

                    let changed = pass.apply(graph).map_err(|source| {
                        error!(stage = %kind, pass = name, %source, "pass failed");
                        PipelineError::Pass { stage: kind, pass: name.to_owned(), source }
                    })?;
                    report.executed.push(name.to_owned());
                    last_pass = Some(name);
                    since_checkpoint.push(name);
                    if changed {
                        debug!(stage = %kind, pass = name, "pass changed graph");
                        report.changed.push(name.to_owned());
                    }
                    if stage.validation() == ValidationMode::PerPass {
                        checkpoint(kind, last_pass, &since_checkpoint, graph)?;
                        since_checkpoint.clear();
                        report.checkpoints += 1;
                    }
                }
            }
        }

        info!(stage = %kind, report = %report.summary(), "stage done");
        Ok(report)
    }
}

fn check_unique_names(stage: &Stage) -> Result<()> {
    let mut seen = HashSet::new();
    for name in stage.passes().map(Pass::label) {
        if !seen.insert(name) {
            return Err(PipelineError::DuplicatePass { stage: stage.kind(), pass: name.to_owned() });
        }
    }
    Ok(())
}

fn checkpoint(
    stage: StageKind,
    last_pass: Option<&str>,
    since_checkpoint: &[&str],
    graph: &Graph,
) -> Result<()> {
    graph.validate().map_err(|err| {
        let pass = last_pass.unwrap_or(STAGE_ENTRY).to_owned();
        let node = describe_node(graph, &err);
        let since_checkpoint: Vec<String> = since_checkpoint.iter().map(|p| (*p).to_owned()).collect();
        error!(
            stage = %stage,
            pass = %pass,
            since_checkpoint = ?since_checkpoint,
            node = %node,
            reason = %err,
            "validation checkpoint failed"
        );
        PipelineError::Validation { stage, pass, since_checkpoint, node, reason: err.to_string() }
    })
}

fn describe_node(graph: &Graph, err: &GraphError) -> String {
    match err.node() {
        Some(id) => graph.node(id).map_or_else(|| id.to_string(), ToString::to_string),
        None => "<graph>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::Scope;
    use kiln_common::HardwareTier;
    use kiln_graph::{ElementType, OpKind, PartialShape};

    fn graph() -> Graph {
        let mut g = Graph::new("m");
        let x = g.add_parameter("x", ElementType::F32, PartialShape::from_static(&[2]));
        let r = g.add_node("r", OpKind::Relu, vec![x.into()]).unwrap();
        g.add_result("out", r.into()).unwrap();
        g
    }

    fn noop(name: &str) -> Pass {
        Pass::new(name, |_: &mut Graph, _: &Scope<'_>| Ok::<_, GraphError>(false))
    }

    #[test]
    fn tier_mismatch_is_recorded_not_executed() {
        let stage = Stage::new(StageKind::PreQuantization, ValidationMode::PerPass)
            .with_pass(noop("Common"))
            .with_pass(noop("ArmOnly").with_tier(HardwareTier::Arm));
        let report = PassManager::new(IsaFamily::X64).run(&stage, &mut graph()).unwrap();
        assert_eq!(report.executed, ["Common"]);
        assert_eq!(report.skipped_by_tier, ["ArmOnly"]);
        assert_eq!(report.checkpoints, 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let stage = Stage::new(StageKind::PostFusion, ValidationMode::Disabled)
            .with_pass(noop("Same"))
            .with_pass(noop("Same"));
        let err = PassManager::new(IsaFamily::X64).run(&stage, &mut graph()).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicatePass { .. }));
    }

    #[test]
    fn numbered_instances_may_share_a_name() {
        let stage = Stage::new(StageKind::PostFusion, ValidationMode::Disabled)
            .with_pass(noop("Same"))
            .with_pass(noop("Same").with_instance(2));
        let report = PassManager::new(IsaFamily::X64).run(&stage, &mut graph()).unwrap();
        assert_eq!(report.executed, ["Same", "Same#2"]);

        let report = PassManager::new(IsaFamily::X64)
            .with_disabled_passes(["Same"])
            .run(&stage, &mut graph())
            .unwrap();
        assert_eq!(report.skipped_by_config, ["Same", "Same#2"]);
    }

    #[test]
    fn disabled_checkpoints_do_not_validate() {
        let mut g = graph();
        let x = g.parameters()[0];
        g.node_mut(x).unwrap().outputs[0].element_type = ElementType::I32;
        let stage = Stage::new(StageKind::PostQuantization, ValidationMode::Disabled).with_checkpoint();
        let report = PassManager::new(IsaFamily::X64).run(&stage, &mut g).unwrap();
        assert_eq!(report.checkpoints, 0);
    }

    #[test]
    fn checkpoint_before_any_pass_names_stage_entry() {
        let mut g = graph();
        let x = g.parameters()[0];
        g.node_mut(x).unwrap().outputs[0].element_type = ElementType::I32;
        let stage = Stage::new(StageKind::PrecisionConversion, ValidationMode::Checkpoints).with_checkpoint();
        let err = PassManager::new(IsaFamily::X64).run(&stage, &mut g).unwrap_err();
        assert_eq!(err.pass(), Some(STAGE_ENTRY));
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn failure_lists_every_pass_since_the_last_checkpoint() {
        let corrupt = Pass::from_fn("Corrupt", |g: &mut Graph, _| {
            let x = g.parameters()[0];
            if let Some(node) = g.node_mut(x) {
                node.outputs[0].element_type = ElementType::I32;
            }
            Ok(true)
        });
        let stage = Stage::new(StageKind::PrecisionConversion, ValidationMode::Checkpoints)
            .with_pass(noop("Before"))
            .with_checkpoint()
            .with_pass(corrupt)
            .with_pass(noop("After"))
            .with_checkpoint();
        let err = PassManager::new(IsaFamily::X64).run(&stage, &mut graph()).unwrap_err();
        let PipelineError::Validation { pass, since_checkpoint, .. } = &err else {
            panic!("expected a validation error, got {err}");
        };
        assert_eq!(pass, "After");
        assert_eq!(since_checkpoint, &["Corrupt", "After"]);
        assert!(err.to_string().contains("Corrupt"));
    }
}
