//! Common types, errors and configuration for softmax-accel.
//!
//! This crate provides the foundations shared by the device runtime and the
//! kernels: the error taxonomy surfaced to callers, the strategy/target enums
//! used to select an execution path, TOML + environment configuration, and the
//! probability-distribution checks every strategy is validated against.

pub mod config;
pub mod error;
pub mod types;
pub mod validation;

pub use config::{ConfigError, SoftmaxConfig};
pub use error::{Result, SoftmaxError};
pub use types::{
    CombineMode, DeviceTarget, KernelVariant, QueueOrdering, ResidencyKind, Strategy,
};
pub use validation::{
    DistributionReport, SUM_TOLERANCE, max_abs_diff, probability_sum, validate_distribution,
};
