//! Pipeline error types.

use kiln_common::{ConfigError, StageKind};
use kiln_graph::GraphError;

/// Placeholder pass name for checkpoints reached before any pass ran.
pub const STAGE_ENTRY: &str = "<stage entry>";

/// Errors that abort a pipeline run.
///
/// No rollback happens: the graph is left as the failing pass produced it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A validation checkpoint found a malformed graph.
    ///
    /// `since_checkpoint` lists every pass executed since the previous
    /// checkpoint of the stage; any of them may have broken the graph.
    #[error(
        "stage {stage}: graph invalid after pass '{pass}' at {node}: {reason} \
         (passes since last checkpoint: {since_checkpoint:?})"
    )]
    Validation {
        stage: StageKind,
        pass: String,
        since_checkpoint: Vec<String>,
        node: String,
        reason: String,
    },

    /// A pass failed while mutating the graph.
    #[error("stage {stage}: pass '{pass}' failed: {source}")]
    Pass {
        stage: StageKind,
        pass: String,
        #[source]
        source: GraphError,
    },

    /// Two passes in one stage share a name.
    #[error("stage {stage}: pass '{pass}' registered twice")]
    DuplicatePass { stage: StageKind, pass: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Name of the pass the error is attributed to, if any.
    pub fn pass(&self) -> Option<&str> {
        match self {
            Self::Validation { pass, .. } | Self::Pass { pass, .. } | Self::DuplicatePass { pass, .. } => {
                Some(pass)
            }
            Self::Config(_) => None,
        }
    }

    pub const fn stage(&self) -> Option<StageKind> {
        match self {
            Self::Validation { stage, .. }
            | Self::Pass { stage, .. }
            | Self::DuplicatePass { stage, .. } => Some(*stage),
            Self::Config(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
