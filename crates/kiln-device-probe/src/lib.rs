//! CPU capability probing for the kiln optimization pipeline.
//!
//! A [`CapabilityProbe`] answers feature queries about the compilation target.
//! [`CapabilityReport::snapshot`] queries a probe exactly once and freezes the
//! answers, together with the run configuration, into an immutable report that
//! every stage of the pipeline reads from.

use kiln_common::{CpuFeature, ElementType, GatingMode, IsaFamily, PipelineConfig};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

/// Fallback L1 data cache size when the platform does not report one.
pub const DEFAULT_L1_CACHE_BYTES: usize = 32 * 1024;

// ── Probe trait ──────────────────────────────────────────────────────────────

/// Query surface over the compilation target's hardware.
pub trait CapabilityProbe {
    /// Instruction-set family of the target.
    fn isa_family(&self) -> IsaFamily;

    /// Whether the target supports `feature`.
    fn supports(&self, feature: CpuFeature) -> bool;

    /// Requested inference precision, or `None` when unspecified.
    fn current_precision_mode(&self) -> Option<ElementType>;

    /// Logical threads available to the process (always ≥ 1).
    fn max_threads(&self) -> usize;

    /// Per-core L1 data cache size in bytes.
    fn l1_cache_bytes(&self) -> usize {
        DEFAULT_L1_CACHE_BYTES
    }
}

// ── Host detection ───────────────────────────────────────────────────────────

/// Detect the CPU features of the running machine.
///
/// Honours `KILN_CPU_FAKE` (comma-separated feature names, or `none`) for
/// deterministic testing unless `KILN_STRICT_MODE=1` is set.
pub fn detect_features() -> BTreeSet<CpuFeature> {
    if let Some(fake) = fake_cpu_features() {
        debug!(features = ?fake, "using KILN_CPU_FAKE feature set");
        return fake;
    }
    detect_host_features()
}

fn strict_mode_enabled() -> bool {
    std::env::var("KILN_STRICT_MODE")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn fake_cpu_features() -> Option<BTreeSet<CpuFeature>> {
    if strict_mode_enabled() {
        return None;
    }

    let fake = std::env::var("KILN_CPU_FAKE").ok()?;
    let normalized = fake.trim().to_ascii_lowercase();

    if normalized == "none" {
        return Some(BTreeSet::new());
    }

    let set = normalized
        .split([',', ';', '|', ' '])
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse::<CpuFeature>().ok())
        .collect();

    Some(set)
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn detect_host_features() -> BTreeSet<CpuFeature> {
    use std::arch::x86_64::{__cpuid, __cpuid_count};

    const fn bit(reg: u32, n: u32) -> bool {
        reg & (1 << n) != 0
    }

    let mut found = BTreeSet::new();
    if is_x86_feature_detected!("sse4.2") {
        found.insert(CpuFeature::Sse42);
    }
    let avx2 = is_x86_feature_detected!("avx2");
    if avx2 {
        found.insert(CpuFeature::Avx2);
    }
    // avx512f detection also confirms the OS saves the upper register state.
    let avx512_os = is_x86_feature_detected!("avx512f");

    // SAFETY: CPUID is available on every x86_64 processor.
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if max_leaf < 7 {
        return found;
    }
    // SAFETY: leaf 7 is supported (checked above).
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    // SAFETY: sub-leaf 1 is supported when leaf 7 reports it.
    let leaf7_1 = (leaf7.eax >= 1).then(|| unsafe { __cpuid_count(7, 1) });

    let avx512_core = avx512_os
        && bit(leaf7.ebx, 16)
        && bit(leaf7.ebx, 17)
        && bit(leaf7.ebx, 30)
        && bit(leaf7.ebx, 31);

    if let Some(sub1) = leaf7_1 {
        if avx2 && bit(sub1.eax, 4) {
            found.insert(CpuFeature::Avx2Vnni);
        }
        if avx2 && bit(sub1.edx, 4) {
            found.insert(CpuFeature::Avx2Vnni2);
        }
        if avx512_core && bit(sub1.eax, 5) {
            found.insert(CpuFeature::Avx512CoreBf16);
        }
        if avx512_core && bit(leaf7.edx, 22) && bit(leaf7.edx, 24) && bit(sub1.eax, 21) {
            found.insert(CpuFeature::AmxFp16);
        }
    }
    if avx512_core {
        found.insert(CpuFeature::Avx512Core);
        if bit(leaf7.ecx, 11) {
            found.insert(CpuFeature::Avx512CoreVnni);
        }
        if bit(leaf7.edx, 23) {
            found.insert(CpuFeature::Avx512CoreFp16);
        }
        if bit(leaf7.edx, 22) && bit(leaf7.edx, 24) && bit(leaf7.edx, 25) {
            found.insert(CpuFeature::Amx);
        }
    }
    found
}

#[cfg(target_arch = "aarch64")]
fn detect_host_features() -> BTreeSet<CpuFeature> {
    // NEON is mandatory on AArch64.
    let mut found = BTreeSet::from([CpuFeature::Asimd]);
    if std::arch::is_aarch64_feature_detected!("fp16") {
        found.insert(CpuFeature::Fp16Arith);
    }
    if std::arch::is_aarch64_feature_detected!("sve") {
        found.insert(CpuFeature::Sve);
    }
    found
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_host_features() -> BTreeSet<CpuFeature> {
    BTreeSet::new()
}

/// Read the L1 data cache size of cpu0 from sysfs.
fn detect_l1_cache_bytes() -> Option<usize> {
    let base = std::path::Path::new("/sys/devices/system/cpu/cpu0/cache");
    for idx in 0..4 {
        let dir = base.join(format!("index{idx}"));
        let level = std::fs::read_to_string(dir.join("level")).ok()?;
        let kind = std::fs::read_to_string(dir.join("type")).ok()?;
        if level.trim() != "1" || kind.trim() != "Data" {
            continue;
        }
        let size = std::fs::read_to_string(dir.join("size")).ok()?;
        return parse_cache_size(&size);
    }
    None
}

/// Parse sysfs cache sizes such as `48K` or `2M`.
fn parse_cache_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let (digits, scale) = match raw.chars().last()? {
        'K' | 'k' => (&raw[..raw.len() - 1], 1024),
        'M' | 'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        _ => (raw, 1),
    };
    digits.parse::<usize>().ok().map(|n| n * scale)
}

/// Probe of the machine the compiler runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProbe {
    family: IsaFamily,
    features: BTreeSet<CpuFeature>,
    precision: Option<ElementType>,
    threads: usize,
    l1_cache_bytes: usize,
}

impl HostProbe {
    /// Detect the host and record the requested inference precision.
    pub fn detect(requested_precision: Option<ElementType>) -> Self {
        let threads =
            std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1);
        Self {
            family: IsaFamily::host(),
            features: detect_features(),
            precision: requested_precision,
            threads,
            l1_cache_bytes: detect_l1_cache_bytes().unwrap_or(DEFAULT_L1_CACHE_BYTES),
        }
    }
}

impl CapabilityProbe for HostProbe {
    fn isa_family(&self) -> IsaFamily {
        self.family
    }

    fn supports(&self, feature: CpuFeature) -> bool {
        self.features.contains(&feature)
    }

    fn current_precision_mode(&self) -> Option<ElementType> {
        self.precision
    }

    fn max_threads(&self) -> usize {
        self.threads
    }

    fn l1_cache_bytes(&self) -> usize {
        self.l1_cache_bytes
    }
}

/// Fixed probe answers, for tests and cross-compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticProbe {
    family: IsaFamily,
    features: BTreeSet<CpuFeature>,
    precision: Option<ElementType>,
    threads: usize,
    l1_cache_bytes: usize,
}

impl StaticProbe {
    /// A probe for `family` with no features, one thread, unspecified precision.
    pub const fn new(family: IsaFamily) -> Self {
        Self {
            family,
            features: BTreeSet::new(),
            precision: None,
            threads: 1,
            l1_cache_bytes: DEFAULT_L1_CACHE_BYTES,
        }
    }

    #[must_use]
    pub fn with_features(mut self, features: impl IntoIterator<Item = CpuFeature>) -> Self {
        self.features.extend(features);
        self
    }

    #[must_use]
    pub const fn with_precision(mut self, precision: Option<ElementType>) -> Self {
        self.precision = precision;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    #[must_use]
    pub const fn with_l1_cache_bytes(mut self, bytes: usize) -> Self {
        self.l1_cache_bytes = bytes;
        self
    }
}

impl CapabilityProbe for StaticProbe {
    fn isa_family(&self) -> IsaFamily {
        self.family
    }

    fn supports(&self, feature: CpuFeature) -> bool {
        self.features.contains(&feature)
    }

    fn current_precision_mode(&self) -> Option<ElementType> {
        self.precision
    }

    fn max_threads(&self) -> usize {
        self.threads
    }

    fn l1_cache_bytes(&self) -> usize {
        self.l1_cache_bytes
    }
}

// ── Capability report ────────────────────────────────────────────────────────

/// Immutable snapshot of hardware support and run configuration.
///
/// Built once per compilation by [`CapabilityReport::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityReport {
    family: IsaFamily,
    /// Most-capable first.
    features: Vec<CpuFeature>,
    inference_precision: Option<ElementType>,
    quantization_mode: GatingMode,
    fusion_mode: GatingMode,
    concurrency: usize,
    sub_streams: usize,
    l1_cache_bytes: usize,
}

impl CapabilityReport {
    /// Query `probe` once and freeze the answers together with `config`.
    ///
    /// A precision requested in `config` wins over the probe's precision mode.
    /// A `thread_count` of 0 falls back to the probe's thread count.
    pub fn snapshot(probe: &dyn CapabilityProbe, config: &PipelineConfig) -> Self {
        let mut features: Vec<CpuFeature> =
            CpuFeature::ALL.into_iter().filter(|feat| probe.supports(*feat)).collect();
        features.sort_unstable_by(|a, b| b.cmp(a));

        let concurrency = match config.thread_count {
            0 => probe.max_threads().max(1),
            n => n as usize,
        };

        let report = Self {
            family: probe.isa_family(),
            features,
            inference_precision: config.inference_precision.or(probe.current_precision_mode()),
            quantization_mode: config.quantization_mode,
            fusion_mode: config.fusion_mode,
            concurrency,
            sub_streams: config.sub_stream_count as usize,
            l1_cache_bytes: probe.l1_cache_bytes(),
        };
        info!(report = %report.summary(), "capability snapshot");
        report
    }

    pub const fn isa_family(&self) -> IsaFamily {
        self.family
    }

    /// Supported features, most-capable first.
    pub fn features(&self) -> &[CpuFeature] {
        &self.features
    }

    pub fn supports(&self, feature: CpuFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Requested inference precision, `None` when unspecified.
    pub const fn inference_precision(&self) -> Option<ElementType> {
        self.inference_precision
    }

    pub const fn quantization_mode(&self) -> GatingMode {
        self.quantization_mode
    }

    pub const fn fusion_mode(&self) -> GatingMode {
        self.fusion_mode
    }

    /// Worker threads a fused kernel should keep busy (always ≥ 1).
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Sub-stream count from the configuration. No stage gate reads it; it
    /// is carried for the backend lowering that splits work across streams.
    pub const fn sub_streams(&self) -> usize {
        self.sub_streams
    }

    pub const fn l1_cache_bytes(&self) -> usize {
        self.l1_cache_bytes
    }

    /// Whether the target computes natively in `precision`.
    ///
    /// Types other than `bf16` and `f16` are always considered supported.
    pub fn has_hardware_support(&self, precision: ElementType) -> bool {
        match precision {
            ElementType::Bf16 => {
                self.family == IsaFamily::X64
                    && (self.supports(CpuFeature::Avx512CoreBf16) || self.supports(CpuFeature::Amx))
            }
            ElementType::F16 => match self.family {
                IsaFamily::X64 => {
                    self.supports(CpuFeature::Avx512CoreFp16) || self.supports(CpuFeature::AmxFp16)
                }
                IsaFamily::Arm64 => self.supports(CpuFeature::Fp16Arith),
                _ => false,
            },
            _ => true,
        }
    }

    /// The lowest vector tier the fusion code generator accepts.
    pub fn has_min_fusion_tier(&self) -> bool {
        match self.family {
            IsaFamily::X64 => self.supports(CpuFeature::Avx2),
            IsaFamily::Arm64 => self.supports(CpuFeature::Asimd),
            _ => false,
        }
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let features: Vec<&str> = self.features.iter().map(|f| f.name()).collect();
        format!(
            "family={} features=[{}] precision={} quantization={} fusion={} concurrency={} sub_streams={}",
            self.family,
            features.join(","),
            self.inference_precision.map_or_else(|| "unspecified".to_string(), |p| p.to_string()),
            self.quantization_mode,
            self.fusion_mode,
            self.concurrency,
            self.sub_streams,
        )
    }
}

impl fmt::Display for CapabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn cache_size_parsing() {
        assert_eq!(parse_cache_size("48K\n"), Some(48 * 1024));
        assert_eq!(parse_cache_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_cache_size("512"), Some(512));
        assert_eq!(parse_cache_size(""), None);
        assert_eq!(parse_cache_size("xK"), None);
    }

    #[test]
    #[serial(kiln_env)]
    fn fake_env_overrides_detection() {
        temp_env::with_vars(
            [("KILN_STRICT_MODE", None::<&str>), ("KILN_CPU_FAKE", Some("avx2,avx512_core"))],
            || {
                let found = detect_features();
                assert_eq!(found, BTreeSet::from([CpuFeature::Avx2, CpuFeature::Avx512Core]));
            },
        );
        temp_env::with_vars(
            [("KILN_STRICT_MODE", None::<&str>), ("KILN_CPU_FAKE", Some("none"))],
            || assert!(detect_features().is_empty()),
        );
    }

    #[test]
    #[serial(kiln_env)]
    fn strict_mode_ignores_fake() {
        temp_env::with_vars(
            [("KILN_STRICT_MODE", Some("1")), ("KILN_CPU_FAKE", Some("none"))],
            || assert_eq!(detect_features(), detect_host_features()),
        );
    }

    #[test]
    fn host_probe_reports_at_least_one_thread() {
        let probe = HostProbe::detect(None);
        assert!(probe.max_threads() >= 1);
        assert_eq!(probe.isa_family(), IsaFamily::host());
    }

    #[test]
    fn host_features_are_deterministic() {
        assert_eq!(detect_host_features(), detect_host_features());
    }
}
