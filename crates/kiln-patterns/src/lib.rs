//! Stateless graph-pattern predicates.
//!
//! Every predicate takes a read-only [`kiln_graph::NodeView`] (or the whole
//! graph) and answers one question about the local neighbourhood. A `false`
//! answer is never an error: it means the pass asking does not apply there.

pub mod attention;
pub mod decompression;
pub mod fusion;
pub mod quantization;

pub use attention::{
    MhaRegion, find_mha_second_matmul, has_paged_attention, is_stateful, is_supported_sdpa,
    keeps_fused_sdpa, match_mha, qkv_projection_candidates,
};
pub use decompression::{
    all_consumers_are, feeds_decompression_multiply, has_matmul_consumer,
    is_decompression_multiply,
};
pub use fusion::{FusionPolicy, is_matmul_post_op, is_tokenizable_kind};
pub use quantization::{
    DECOMPRESSION_PRECISIONS, INT8_PRECISIONS, SUPPORTED_FQ_LEVELS, activation_precisions,
    can_move_eltwise_up, is_quantized_model, is_supported_fake_quantize,
};
