//! Evaluation configuration for softmax-accel.
//!
//! Loads [`SoftmaxConfig`] from a TOML file (`softmax.toml`) with environment
//! variable overrides via `SOFTMAX_*` prefixed variables. Missing TOML keys
//! fall back to [`SoftmaxConfig::default`].

use crate::types::{CombineMode, DeviceTarget, KernelVariant, QueueOrdering, ResidencyKind, Strategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Largest work-group size accepted by validation.
pub const MAX_GROUP_SIZE: usize = 1024;

/// Evaluation configuration loaded from TOML with environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxConfig {
    /// Strategy used by `SoftmaxEvaluator::evaluate`.
    /// Override: `SOFTMAX_STRATEGY`
    pub strategy: Strategy,

    /// Device class the execution context binds to.
    /// Override: `SOFTMAX_DEVICE`
    pub target: DeviceTarget,

    /// Ordering between successive queue submissions.
    /// Override: `SOFTMAX_QUEUE_ORDER`
    pub ordering: QueueOrdering,

    /// Residency used by the tiled strategy.
    /// Override: `SOFTMAX_RESIDENCY`
    pub residency: ResidencyKind,

    /// Flat kernel variant used by the four residency strategies.
    /// Override: `SOFTMAX_KERNEL_VARIANT`
    pub kernel_variant: KernelVariant,

    /// Work-group size G for the tiled strategy.
    /// Override: `SOFTMAX_GROUP_SIZE`
    pub group_size: usize,

    /// How tiled partial sums are combined.
    /// Override: `SOFTMAX_COMBINE`
    pub combine: CombineMode,

    /// Elements summed per partial in the reduced flat kernel.
    /// Override: `SOFTMAX_REDUCTION_CHUNK`
    pub reduction_chunk: usize,

    /// Subtract the input maximum before exponentiation.
    /// Override: `SOFTMAX_STABLE`
    pub numerically_stable: bool,

    /// Device worker threads (0 = one per logical core).
    /// Override: `SOFTMAX_THREADS`
    pub threads: usize,

    /// Device memory limit in bytes (0 = unlimited).
    /// Override: `SOFTMAX_MEMORY_LIMIT`
    pub memory_limit: u64,
}

impl Default for SoftmaxConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::StagedCopy,
            target: DeviceTarget::Default,
            ordering: QueueOrdering::InOrder,
            residency: ResidencyKind::SharedManaged,
            kernel_variant: KernelVariant::Reduced,
            group_size: 64,
            combine: CombineMode::TwoPass,
            reduction_chunk: 1024,
            numerically_stable: false,
            threads: 0,
            memory_limit: 0,
        }
    }
}

/// Errors that can occur when loading or validating a [`SoftmaxConfig`].
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

impl SoftmaxConfig {
    /// Default configuration rendered as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: SoftmaxConfig = toml::from_str(toml_str)?;
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

    /// Same configuration with a different strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_size == 0 {
            return Err(ConfigError::Validation("group_size must be > 0".into()));
        }
        if self.group_size > MAX_GROUP_SIZE {
            return Err(ConfigError::Validation(format!(
                "group_size must be <= {MAX_GROUP_SIZE}, got {}",
                self.group_size
            )));
        }
        if self.reduction_chunk == 0 {
            return Err(ConfigError::Validation("reduction_chunk must be > 0".into()));
        }
        Ok(())
    }

    /// Apply `SOFTMAX_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env::<Strategy>("SOFTMAX_STRATEGY")? {
            self.strategy = v;
        }
        if let Some(v) = parse_env::<DeviceTarget>("SOFTMAX_DEVICE")? {
            self.target = v;
        }
        if let Some(v) = parse_env::<QueueOrdering>("SOFTMAX_QUEUE_ORDER")? {
            self.ordering = v;
        }
        if let Some(v) = parse_env::<ResidencyKind>("SOFTMAX_RESIDENCY")? {
            self.residency = v;
        }
        if let Some(v) = parse_env::<KernelVariant>("SOFTMAX_KERNEL_VARIANT")? {
            self.kernel_variant = v;
        }
        if let Some(v) = parse_env::<usize>("SOFTMAX_GROUP_SIZE")? {
            self.group_size = v;
        }
        if let Some(v) = parse_env::<CombineMode>("SOFTMAX_COMBINE")? {
            self.combine = v;
        }
        if let Some(v) = parse_env::<usize>("SOFTMAX_REDUCTION_CHUNK")? {
            self.reduction_chunk = v;
        }
        if let Ok(val) = std::env::var("SOFTMAX_STABLE") {
            self.numerically_stable = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = parse_env::<usize>("SOFTMAX_THREADS")? {
            self.threads = v;
        }
        if let Some(v) = parse_env::<u64>("SOFTMAX_MEMORY_LIMIT")? {
            self.memory_limit = v;
        }
        Ok(())
    }
}

/// Read and parse one override; `Ok(None)` when the variable is unset.
fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: value.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}
