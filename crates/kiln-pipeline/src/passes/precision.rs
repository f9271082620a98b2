//! Precision conversion as a pass.

use crate::pass::{Pass, Rewrite, Scope};
use kiln_graph::Graph;
use kiln_precision::{ConvertOptions, PrecisionMap, convert_precision};
use tracing::debug;

pub const CONVERT_PRECISION: &str = "ConvertPrecision";
pub const CONVERT_PRECISION_F16: &str = "ConvertPrecisionF16";

/// Runs the conversion engine with a fixed map.
///
/// Works on the whole graph; a predicate has no effect.
#[derive(Debug, Clone)]
pub struct ConvertPrecision {
    map: PrecisionMap,
    options: ConvertOptions,
}

impl ConvertPrecision {
    pub const fn new(map: PrecisionMap, options: ConvertOptions) -> Self {
        Self { map, options }
    }

    pub fn map(&self) -> &PrecisionMap {
        &self.map
    }
}

impl Rewrite for ConvertPrecision {
    fn apply(&self, graph: &mut Graph, _scope: &Scope<'_>) -> kiln_graph::Result<bool> {
        let stats = convert_precision(graph, &self.map, &self.options)?;
        debug!(map = %self.map, %stats, "precision conversion");
        Ok(stats.changed())
    }
}

/// The main conversion to backend types.
pub fn convert_precision_pass(map: PrecisionMap) -> Pass {
    Pass::new(CONVERT_PRECISION, ConvertPrecision::new(map, ConvertOptions::default()))
}

/// The f32 -> f16 lowering run before the main conversion under f16
/// inference. Precision-sensitive operations and shape computations stay
/// in f32.
pub fn convert_precision_f16_pass(map: PrecisionMap, fuse_fake_quantize: bool) -> Pass {
    let options = ConvertOptions::default()
        .with_fuse_fake_quantize(fuse_fake_quantize)
        .with_keep_precision_sensitive(true);
    Pass::new(CONVERT_PRECISION_F16, ConvertPrecision::new(map, options))
}
