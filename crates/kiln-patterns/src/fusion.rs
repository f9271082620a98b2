//! Kernel-fusion eligibility.
//!
//! [`FusionPolicy`] freezes the capability answers the fusion predicates
//! need so a stage can capture it by value in its pass closures.

use crate::attention::match_mha;
use kiln_common::{CpuFeature, ElementType, GatingMode, IsaFamily};
use kiln_device_probe::CapabilityReport;
use kiln_graph::{Dim, NodeView, OpKind};
use tracing::trace;

/// General-purpose registers left for data pointers in a fused kernel.
pub const X64_DATA_PTR_GPRS: usize = 11;
pub const ARM64_DATA_PTR_GPRS: usize = 23;

/// Highest tensor rank a fused kernel accepts.
pub const MAX_FUSED_RANK: usize = 6;

/// Smallest M block a split matrix-multiply kernel still runs efficiently.
pub const MIN_KERNEL_M: usize = 32;

/// Fusion gates derived from one capability report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionPolicy {
    pub family: IsaFamily,
    pub precision: Option<ElementType>,
    pub fusion_enabled: bool,
    /// Optional per-node predicates are dropped.
    pub ignore_gating: bool,
    pub concurrency: usize,
    /// The M dimension of a matrix multiply may be re-split for parallelism.
    pub split_m: bool,
    pub l1_cache_bytes: usize,
    pub int8_matmul: bool,
    pub bf16_matmul: bool,
    pub amx: bool,
    pub avx512_core: bool,
}

impl FusionPolicy {
    pub fn from_report(report: &CapabilityReport) -> Self {
        let ignore_gating = report.fusion_mode() == GatingMode::IgnoreGating;
        Self {
            family: report.isa_family(),
            precision: report.inference_precision(),
            fusion_enabled: report.fusion_mode().is_enabled(),
            ignore_gating,
            concurrency: report.concurrency(),
            split_m: !ignore_gating,
            l1_cache_bytes: report.l1_cache_bytes(),
            int8_matmul: report.supports(CpuFeature::Avx512CoreVnni),
            bf16_matmul: report.supports(CpuFeature::Avx512CoreBf16),
            amx: report.supports(CpuFeature::Amx),
            avx512_core: report.supports(CpuFeature::Avx512Core),
        }
    }

    /// Data-pointer registers available to one fused region.
    pub const fn data_ptr_gpr_count(&self) -> usize {
        match self.family {
            IsaFamily::Arm64 => ARM64_DATA_PTR_GPRS,
            _ => X64_DATA_PTR_GPRS,
        }
    }

    /// Attention blocks need 512-bit cores and a precision the batched
    /// matrix-multiply kernel computes in.
    pub fn mha_supported(&self) -> bool {
        self.family == IsaFamily::X64
            && self.avx512_core
            && matches!(self.precision, None | Some(ElementType::F32) | Some(ElementType::Bf16))
    }

    /// Element types a fused kernel reads and writes.
    fn supported_types(&self) -> &'static [ElementType] {
        match self.family {
            IsaFamily::Arm64 => &[ElementType::F32],
            _ => &[
                ElementType::F32,
                ElementType::Bf16,
                ElementType::F16,
                ElementType::I8,
                ElementType::U8,
            ],
        }
    }

    // ── Per-node checks ────────────────────────────────────────────────────

    /// Operation kinds the generic tokenizer may pull into a region.
    pub fn is_supported_op(&self, view: &NodeView<'_>) -> bool {
        let op = view.op();
        if self.family == IsaFamily::Arm64 {
            return matches!(
                op,
                OpKind::Abs
                    | OpKind::Add
                    | OpKind::Clamp { .. }
                    | OpKind::Divide
                    | OpKind::Exp
                    | OpKind::Floor
                    | OpKind::Gelu
                    | OpKind::Maximum
                    | OpKind::Minimum
                    | OpKind::Mish
                    | OpKind::Multiply
                    | OpKind::Relu
                    | OpKind::Sigmoid
                    | OpKind::Subtract
                    | OpKind::Swish
                    | OpKind::Tanh
            );
        }
        let swish_with_runtime_beta = matches!(op, OpKind::Swish)
            && view.input_count() > 1
            && !view.input(1).is_some_and(|b| b.op().is_constant());
        let pattern_only = matches!(
            op,
            OpKind::Softmax { .. }
                | OpKind::MatMul { .. }
                | OpKind::Transpose { .. }
                | OpKind::Broadcast { .. }
                | OpKind::ReduceMax { .. }
                | OpKind::ReduceSum { .. }
        );
        is_tokenizable_kind(op) && !swish_with_runtime_beta && !matches!(op, OpKind::Mish) && !pattern_only
    }

    /// Every input and output has a supported type and rank.
    ///
    /// `i32` inputs are accepted for data-movement and reduction nodes.
    pub fn has_supported_tensors(&self, view: &NodeView<'_>) -> bool {
        let int_indices_ok = matches!(
            view.op(),
            OpKind::Transpose { .. }
                | OpKind::Broadcast { .. }
                | OpKind::ReduceMax { .. }
                | OpKind::ReduceSum { .. }
        );
        let tensor_ok = |desc: &kiln_graph::TensorDesc, is_input: bool| {
            if !self.ignore_gating && desc.shape.rank().is_none_or(|r| r > MAX_FUSED_RANK) {
                return false;
            }
            self.supported_types().contains(&desc.element_type)
                || (is_input && int_indices_ok && desc.element_type == ElementType::I32)
        };
        (0..view.input_count()).all(|port| view.input_desc(port).is_some_and(|d| tensor_ok(d, true)))
            && view.node().outputs.iter().all(|d| tensor_ok(d, false))
    }

    /// Every input comes straight from a constant.
    pub fn has_only_const_inputs(&self, view: &NodeView<'_>) -> bool {
        (0..view.input_count()).all(|port| view.input(port).is_some_and(|p| p.op().is_constant()))
    }

    /// Whether the batched matrix-multiply kernel handles this MatMul.
    pub fn is_supported_matmul(&self, view: &NodeView<'_>) -> bool {
        let OpKind::MatMul { transpose_a, transpose_b } = *view.op() else {
            return false;
        };
        if !view.node().is_static() {
            return false;
        }
        let (Some(a), Some(b)) = (view.input_desc(0), view.input_desc(1)) else {
            return false;
        };
        let (ta, tb) = (a.element_type, b.element_type);
        if ta == ElementType::F16 || tb == ElementType::F16 {
            return false;
        }
        let f32_pair = ta == ElementType::F32 && tb == ElementType::F32;
        if f32_pair && matches!(self.precision, None | Some(ElementType::F32)) {
            return true;
        }
        if transpose_a || transpose_b {
            return false;
        }
        if ta == ElementType::I8 {
            return self.int8_matmul;
        }
        let bf16_pair = ta == ElementType::Bf16 && tb == ElementType::Bf16;
        if bf16_pair || (f32_pair && self.precision == Some(ElementType::Bf16)) {
            if self.amx {
                // AMX tiles need K and N aligned to 2.
                let even = |d: Option<Dim>| matches!(d, Some(Dim::Static(n)) if n % 2 == 0);
                return even(a.shape.dim(-1)) && even(b.shape.dim(-1));
            }
            return self.bf16_matmul;
        }
        true
    }

    // ── Parallel work ──────────────────────────────────────────────────────

    /// Product of every dimension except the last two.
    pub fn parallel_work_amount(shape: &[usize]) -> usize {
        shape.iter().rev().skip(2).product()
    }

    /// Whether the M dimension can be split into more parallel chunks so that
    /// the work amount reaches the concurrency.
    pub fn can_split_m_dimension(&self, shape: &[usize]) -> bool {
        if !self.split_m || shape.len() < 2 {
            return false;
        }
        let batch = Self::parallel_work_amount(shape);
        let m = shape[shape.len() - 2];
        (2..=m).any(|split| {
            m % split == 0 && m / split >= MIN_KERNEL_M && batch * split >= self.concurrency
        })
    }

    /// Too little outer work to keep every thread busy, and no re-split.
    pub fn is_unsupported_parallel_work_amount(&self, shape: &[usize]) -> bool {
        Self::parallel_work_amount(shape) < self.concurrency && !self.can_split_m_dimension(shape)
    }

    // ── Region eligibility ─────────────────────────────────────────────────

    /// Whether the generic tokenizer may start or extend a region at `view`.
    pub fn is_tokenizable(&self, view: &NodeView<'_>) -> bool {
        if !is_tokenizable_kind(view.op()) {
            return false;
        }
        if !self.ignore_gating && (!view.node().is_static() || !self.is_supported_op(view)) {
            trace!(node = %view.id(), op = %view.op(), "not tokenizable: dynamic or unsupported op");
            return false;
        }
        if self.has_only_const_inputs(view) {
            return false;
        }
        self.has_supported_tensors(view)
    }

    /// Whether the MHA block starting at MatMul `view` should be fused.
    pub fn is_mha_tokenizable(&self, view: &NodeView<'_>) -> bool {
        let Some(region) = match_mha(view) else {
            return false;
        };
        if self.ignore_gating {
            return true;
        }
        if !self.is_supported_matmul(view) {
            return false;
        }
        let Some(second) = NodeView::new(view.graph(), region.second_matmul) else {
            return false;
        };
        if !self.is_supported_matmul(&second) {
            return false;
        }
        match second.input_desc(0).and_then(|d| d.shape.to_static()) {
            Some(shape) => !self.is_unsupported_parallel_work_amount(&shape),
            None => false,
        }
    }

    /// Whether a GroupNormalization runs faster fused than decomposed.
    ///
    /// Needs enough `batch * groups` work for every thread and a per-group
    /// slice that fits in L1.
    pub fn is_group_norm_tokenizable(&self, view: &NodeView<'_>) -> bool {
        let OpKind::GroupNormalization { num_groups, .. } = *view.op() else {
            return false;
        };
        if !self.fusion_enabled
            || !view.node().is_static()
            || !matches!(self.precision, None | Some(ElementType::F32))
        {
            return false;
        }
        if self.ignore_gating {
            return true;
        }
        let Some(desc) = view.input_desc(0) else {
            return false;
        };
        if self.precision.is_none() && desc.element_type != ElementType::F32 {
            return false;
        }
        let Some(shape) = desc.shape.to_static() else {
            return false;
        };
        if shape.len() < 2 || num_groups == 0 {
            return false;
        }
        if shape[0] * num_groups < self.concurrency {
            return false;
        }
        let spatial: usize = shape[2..].iter().product();
        let slice_bytes = spatial * shape[1] / num_groups * desc.element_type.size_in_bytes();
        slice_bytes <= self.l1_cache_bytes
    }
}

/// Operation kinds any fused kernel can express.
pub fn is_tokenizable_kind(op: &OpKind) -> bool {
    op.is_elementwise()
        || matches!(
            op,
            OpKind::Convert { .. }
                | OpKind::FakeQuantize { .. }
                | OpKind::Transpose { .. }
                | OpKind::Broadcast { .. }
                | OpKind::ReduceMax { .. }
                | OpKind::ReduceSum { .. }
                | OpKind::Softmax { .. }
        )
}

/// Elementwise nodes the backend fuses into a preceding MatMul as post-ops.
///
/// A node qualifies when its first input comes from a MatMul, or from a node
/// already marked to skip fusion, and that producer has no other consumer.
pub fn is_matmul_post_op(view: &NodeView<'_>) -> bool {
    if !(view.op().is_elementwise() || matches!(view.op(), OpKind::FakeQuantize { .. })) {
        return false;
    }
    let Some(producer) = view.input(0) else {
        return false;
    };
    (producer.op().is_matmul() || producer.node().rt.skip_fusion) && producer.consumers().len() == 1
}
