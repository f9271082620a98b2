//! Typed computation-graph IR.
//!
//! A [`Graph`] is a directed acyclic graph of [`Node`]s. Every output carries
//! an element type and a [`PartialShape`], re-derived by [`infer_outputs`]
//! whenever a node changes. Passes mutate the graph through the methods on
//! [`Graph`]; predicates inspect it through [`NodeView`].

pub mod error;
pub mod eval;
pub mod graph;
pub mod infer;
pub mod node;
pub mod shape;
pub mod view;

pub use error::{GraphError, Result};
pub use eval::{EvalError, Tensor, cast_value, evaluate, evaluate_op};
pub use graph::{CanonicalNode, Graph};
pub use infer::{infer_outputs, matmul_shape};
pub use node::{
    ConstantData, InputRef, Node, NodeId, OpKind, OutputRef, RuntimeInfo, TensorDesc,
};
pub use shape::{Dim, PartialShape, normalize_axis};
pub use view::NodeView;

pub use kiln_common::ElementType;
