//! Graph error types.

use crate::node::{NodeId, OutputRef, TensorDesc};

/// Errors raised by graph construction, mutation and validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),
    #[error("node {node} has no port {port}")]
    PortOutOfRange { node: NodeId, port: usize },
    #[error("input {port} of node {node} references missing output {source_ref}")]
    DanglingEdge { node: NodeId, port: usize, source_ref: OutputRef },
    #[error("graph contains a cycle through node {0}")]
    Cycle(NodeId),
    #[error("node {node} still has {consumers} consumer(s)")]
    NodeInUse { node: NodeId, consumers: usize },
    #[error("node '{name}' ({node}): {reason}")]
    TypeMismatch { node: NodeId, name: String, reason: String },
    #[error("node '{name}' ({node}) output {port} is {declared} but its inputs produce {inferred}")]
    StaleOutput { node: NodeId, name: String, port: usize, declared: TensorDesc, inferred: TensorDesc },
    #[error("invalid constant: {0}")]
    InvalidConstant(String),
}

impl GraphError {
    /// Node the error is attributed to, when there is one.
    pub const fn node(&self) -> Option<NodeId> {
        match self {
            Self::NodeNotFound(node) | Self::Cycle(node) => Some(*node),
            Self::PortOutOfRange { node, .. }
            | Self::DanglingEdge { node, .. }
            | Self::NodeInUse { node, .. }
            | Self::TypeMismatch { node, .. }
            | Self::StaleOutput { node, .. } => Some(*node),
            Self::InvalidConstant(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
