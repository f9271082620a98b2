//! Pipeline configuration.
//!
//! Loads [`PipelineConfig`] from a TOML file with environment variable
//! overrides via `KILN_*` prefixed variables.

use crate::element_type::ElementType;
use crate::stage::{StageKind, StageOverride};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// How a lowering feature (quantization, fusion) is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    /// Feature off.
    Disabled,
    /// Feature on, with per-node applicability predicates.
    #[default]
    Enabled,
    /// Feature on, with optional per-node predicates dropped.
    IgnoreGating,
}

impl GatingMode {
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl std::fmt::Display for GatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::IgnoreGating => write!(f, "ignore_gating"),
        }
    }
}

impl std::str::FromStr for GatingMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "disabled" | "off" | "0" => Ok(Self::Disabled),
            "enabled" | "on" | "1" => Ok(Self::Enabled),
            "ignore_gating" | "ignore_callback" => Ok(Self::IgnoreGating),
            other => Err(format!("unknown gating mode: {other}")),
        }
    }
}

/// Precisions a CPU backend accepts as an inference precision hint.
pub const INFERENCE_PRECISIONS: [ElementType; 3] =
    [ElementType::F32, ElementType::Bf16, ElementType::F16];

/// Upper bound on `thread_count`.
pub const MAX_THREADS: u32 = 4096;

/// Pipeline configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Requested inference precision; `None` means unspecified.
    /// Override: `KILN_INFERENCE_PRECISION` (`unspecified` clears it)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_precision: Option<ElementType>,

    /// Quantization-aware lowering.
    /// Override: `KILN_QUANTIZATION_MODE`
    pub quantization_mode: GatingMode,

    /// Kernel fusion / tokenization.
    /// Override: `KILN_FUSION_MODE`
    pub fusion_mode: GatingMode,

    /// Threads per stream (0 = use the capability probe default).
    /// Override: `KILN_THREADS`
    pub thread_count: u32,

    /// Sub-stream count handed to downstream consumers.
    /// Override: `KILN_SUB_STREAMS`
    pub sub_stream_count: u32,

    /// Pass names skipped wherever they are registered.
    /// Override: `KILN_DISABLE_PASSES` (comma separated)
    pub disabled_passes: BTreeSet<String>,

    /// Per-stage debug overrides.
    /// Override: `KILN_DISABLE_STAGES`, `KILN_ENABLE_STAGES` (comma separated)
    pub debug_stage_overrides: BTreeMap<StageKind, StageOverride>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_precision: None,
            quantization_mode: GatingMode::Enabled,
            fusion_mode: GatingMode::Enabled,
            thread_count: 0,
            sub_stream_count: 0,
            disabled_passes: BTreeSet::new(),
            debug_stage_overrides: BTreeMap::new(),
        }
    }
}

/// Errors that can occur when loading or validating a [`PipelineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl PipelineConfig {
    /// Generate the default configuration as a TOML string.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: Self = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Debug override registered for `stage`, if any.
    pub fn stage_override(&self, stage: StageKind) -> Option<StageOverride> {
        self.debug_stage_overrides.get(&stage).copied()
    }

    pub fn is_pass_disabled(&self, name: &str) -> bool {
        self.disabled_passes.contains(name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(precision) = self.inference_precision
            && !INFERENCE_PRECISIONS.contains(&precision)
        {
            return Err(ConfigError::Validation(format!(
                "inference_precision must be one of f32, bf16, f16, got {precision}"
            )));
        }
        if self.thread_count > MAX_THREADS {
            return Err(ConfigError::Validation(format!(
                "thread_count must be <= {MAX_THREADS}, got {}",
                self.thread_count
            )));
        }
        if self.thread_count > 0 && self.sub_stream_count > self.thread_count {
            return Err(ConfigError::Validation(format!(
                "sub_stream_count ({}) must not exceed thread_count ({})",
                self.sub_stream_count, self.thread_count
            )));
        }
        if self.disabled_passes.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Validation("disabled pass names must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `KILN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("KILN_INFERENCE_PRECISION") {
            self.inference_precision = match val.trim().to_lowercase().as_str() {
                "" | "unspecified" | "undefined" => None,
                _ => Some(val.parse::<ElementType>().map_err(|reason| {
                    ConfigError::EnvOverride {
                        key: "KILN_INFERENCE_PRECISION".into(),
                        value: val.clone(),
                        reason,
                    }
                })?),
            };
            debug!(key = "KILN_INFERENCE_PRECISION", value = %val, "config override");
        }

        if let Ok(val) = std::env::var("KILN_QUANTIZATION_MODE") {
            self.quantization_mode =
                val.parse::<GatingMode>().map_err(|reason| ConfigError::EnvOverride {
                    key: "KILN_QUANTIZATION_MODE".into(),
                    value: val.clone(),
                    reason,
                })?;
            debug!(key = "KILN_QUANTIZATION_MODE", value = %val, "config override");
        }

        if let Ok(val) = std::env::var("KILN_FUSION_MODE") {
            self.fusion_mode =
                val.parse::<GatingMode>().map_err(|reason| ConfigError::EnvOverride {
                    key: "KILN_FUSION_MODE".into(),
                    value: val.clone(),
                    reason,
                })?;
            debug!(key = "KILN_FUSION_MODE", value = %val, "config override");
        }

        if let Ok(val) = std::env::var("KILN_THREADS") {
            self.thread_count = val.parse::<u32>().map_err(|e| ConfigError::EnvOverride {
                key: "KILN_THREADS".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
            debug!(key = "KILN_THREADS", value = %val, "config override");
        }

        if let Ok(val) = std::env::var("KILN_SUB_STREAMS") {
            self.sub_stream_count = val.parse::<u32>().map_err(|e| ConfigError::EnvOverride {
                key: "KILN_SUB_STREAMS".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
            debug!(key = "KILN_SUB_STREAMS", value = %val, "config override");
        }

        for (key, forced) in [
            ("KILN_DISABLE_STAGES", StageOverride::ForcedDisabled),
            ("KILN_ENABLE_STAGES", StageOverride::ForcedEnabled),
        ] {
            if let Ok(val) = std::env::var(key) {
                for stage in split_list(&val) {
                    let kind = stage.parse::<StageKind>().map_err(|reason| {
                        ConfigError::EnvOverride { key: key.into(), value: val.clone(), reason }
                    })?;
                    self.debug_stage_overrides.insert(kind, forced);
                }
                debug!(key, value = %val, "config override");
            }
        }

        if let Ok(val) = std::env::var("KILN_DISABLE_PASSES") {
            self.disabled_passes.extend(split_list(&val).map(ToOwned::to_owned));
            debug!(key = "KILN_DISABLE_PASSES", value = %val, "config override");
        }

        Ok(())
    }
}

fn split_list(val: &str) -> impl Iterator<Item = &str> {
    val.split([',', ';', ' ']).map(str::trim).filter(|part| !part.is_empty())
}
