//! Nodes, operation kinds, and port references.

use crate::shape::PartialShape;
use kiln_common::ElementType;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Identity and ports ──────────────────────────────────────────────────────

/// Stable node identity.
///
/// Ids are allocated monotonically and never reused, so an id held across a
/// removal simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A specific output of a producer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: NodeId,
    pub port: usize,
}

impl OutputRef {
    pub const fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

impl From<NodeId> for OutputRef {
    fn from(node: NodeId) -> Self {
        Self { node, port: 0 }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// A specific input of a consumer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputRef {
    pub node: NodeId,
    pub port: usize,
}

impl InputRef {
    pub const fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

/// Element type and shape of one output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub element_type: ElementType,
    pub shape: PartialShape,
}

impl TensorDesc {
    pub const fn new(element_type: ElementType, shape: PartialShape) -> Self {
        Self { element_type, shape }
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.element_type, self.shape)
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

/// Payload of a constant node.
///
/// `values` holds either one element per position or a single splat value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantData {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl ConstantData {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Value at flat index `idx`, expanding splats.
    pub fn value(&self, idx: usize) -> Option<f64> {
        match self.values.as_slice() {
            [splat] => Some(*splat),
            values => values.get(idx).copied(),
        }
    }

    /// Every value is equal (or there is exactly one).
    pub fn is_uniform(&self) -> bool {
        self.values.windows(2).all(|w| w[0] == w[1])
    }
}

/// Operation kind with its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Parameter { element_type: ElementType, shape: PartialShape },
    Constant(ConstantData),
    /// Graph output sink.
    Result,
    Convert { destination: ElementType },

    // unary elementwise
    Abs,
    Ceiling,
    Floor,
    /// Round half to even.
    Round,
    Exp,
    Sqrt,
    Negative,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    /// `x * sigmoid(beta * x)`; optional second input is `beta`.
    Swish,
    Mish,
    Clamp { min: f64, max: f64 },
    HardSigmoid { alpha: f64, beta: f64 },

    // binary elementwise
    Add,
    Subtract,
    Multiply,
    Divide,
    Minimum,
    Maximum,
    Power,

    MatMul { transpose_a: bool, transpose_b: bool },
    /// `0` copies the input dimension, `-1` is inferred.
    Reshape { target: Vec<i64> },
    Transpose { order: Vec<usize> },
    Broadcast { target: Vec<usize> },
    ReduceMax { axes: Vec<i64>, keep_dims: bool },
    ReduceSum { axes: Vec<i64>, keep_dims: bool },
    Softmax { axis: i64 },
    /// Mean-variance normalization over `axes`.
    Mvn { axes: Vec<i64>, eps: f64 },
    /// Inputs: data, scale, bias.
    GroupNormalization { num_groups: usize, eps: f64 },
    /// Inputs: query, key, value, optional mask, optional scale.
    ScaledDotProductAttention { causal: bool },
    /// Inputs: data, input low, input high, output low, output high.
    FakeQuantize { levels: u32 },
    ShapeOf { output_type: ElementType },
    /// Inputs: data, indices.
    Gather { axis: i64 },
    ReadValue { variable: String },
    Assign { variable: String },
    /// Inputs: query, key, value, cache tensors.
    PagedAttention,
    /// Fused projection of one activation by several weight matrices.
    /// Inputs: activation, then one `[N, K]` weight per output.
    QkvProjection,
}

impl OpKind {
    /// Operation type name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "Parameter",
            Self::Constant(_) => "Constant",
            Self::Result => "Result",
            Self::Convert { .. } => "Convert",
            Self::Abs => "Abs",
            Self::Ceiling => "Ceiling",
            Self::Floor => "Floor",
            Self::Round => "Round",
            Self::Exp => "Exp",
            Self::Sqrt => "Sqrt",
            Self::Negative => "Negative",
            Self::Relu => "Relu",
            Self::Sigmoid => "Sigmoid",
            Self::Tanh => "Tanh",
            Self::Gelu => "Gelu",
            Self::Swish => "Swish",
            Self::Mish => "Mish",
            Self::Clamp { .. } => "Clamp",
            Self::HardSigmoid { .. } => "HardSigmoid",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::Minimum => "Minimum",
            Self::Maximum => "Maximum",
            Self::Power => "Power",
            Self::MatMul { .. } => "MatMul",
            Self::Reshape { .. } => "Reshape",
            Self::Transpose { .. } => "Transpose",
            Self::Broadcast { .. } => "Broadcast",
            Self::ReduceMax { .. } => "ReduceMax",
            Self::ReduceSum { .. } => "ReduceSum",
            Self::Softmax { .. } => "Softmax",
            Self::Mvn { .. } => "Mvn",
            Self::GroupNormalization { .. } => "GroupNormalization",
            Self::ScaledDotProductAttention { .. } => "ScaledDotProductAttention",
            Self::FakeQuantize { .. } => "FakeQuantize",
            Self::ShapeOf { .. } => "ShapeOf",
            Self::Gather { .. } => "Gather",
            Self::ReadValue { .. } => "ReadValue",
            Self::Assign { .. } => "Assign",
            Self::PagedAttention => "PagedAttention",
            Self::QkvProjection => "QkvProjection",
        }
    }

    pub const fn is_unary_elementwise(&self) -> bool {
        matches!(
            self,
            Self::Abs
                | Self::Ceiling
                | Self::Floor
                | Self::Round
                | Self::Exp
                | Self::Sqrt
                | Self::Negative
                | Self::Relu
                | Self::Sigmoid
                | Self::Tanh
                | Self::Gelu
                | Self::Swish
                | Self::Mish
                | Self::Clamp { .. }
                | Self::HardSigmoid { .. }
        )
    }

    pub const fn is_binary_elementwise(&self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Subtract
                | Self::Multiply
                | Self::Divide
                | Self::Minimum
                | Self::Maximum
                | Self::Power
        )
    }

    pub const fn is_elementwise(&self) -> bool {
        self.is_unary_elementwise() || self.is_binary_elementwise()
    }

    /// Operations that only move or reinterpret data.
    pub const fn is_data_movement(&self) -> bool {
        matches!(self, Self::Reshape { .. } | Self::Transpose { .. } | Self::Broadcast { .. })
    }

    /// Nodes whose outputs come from attributes rather than inputs.
    pub const fn is_source(&self) -> bool {
        matches!(self, Self::Parameter { .. } | Self::Constant(_))
    }

    /// Nodes that must survive even without consumers.
    pub const fn is_sink(&self) -> bool {
        matches!(self, Self::Result | Self::Assign { .. })
    }

    pub const fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub const fn is_convert(&self) -> bool {
        matches!(self, Self::Convert { .. })
    }

    pub const fn is_matmul(&self) -> bool {
        matches!(self, Self::MatMul { .. })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Runtime info ────────────────────────────────────────────────────────────

/// Per-node flags that passes attach for later passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Precision conversion leaves this node's outputs alone.
    pub keep_precision: bool,
    /// Part of a dequantization chain (convert, subtract, multiply).
    pub dequantization: bool,
    /// Part of a weight decompression chain feeding a matrix multiply.
    pub decompression: bool,
    /// Computes shapes rather than tensor data.
    pub shape_subgraph: bool,
    /// Excluded from kernel fusion.
    pub skip_fusion: bool,
    /// Fused kernel region this node belongs to.
    pub fusion_group: Option<u32>,
}

/// One operation in a [`crate::Graph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Friendly name; downstream tooling keys on it.
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<OutputRef>,
    pub outputs: Vec<TensorDesc>,
    pub rt: RuntimeInfo,
}

impl Node {
    /// Descriptor of output `port`.
    pub fn output(&self, port: usize) -> Option<&TensorDesc> {
        self.outputs.get(port)
    }

    /// Element type of output 0.
    pub fn output_type(&self) -> Option<ElementType> {
        self.outputs.first().map(|d| d.element_type)
    }

    /// Whether every output has a fully static shape.
    pub fn is_static(&self) -> bool {
        self.outputs.iter().all(|d| d.shape.is_static())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' ({})", self.op, self.name, self.id)
    }
}
