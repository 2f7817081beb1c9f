//! Error taxonomy surfaced to callers of every evaluation strategy.
//!
//! All failures are fatal for the evaluation that raised them. None are
//! retried or recovered internally, and no variant ever carries a partial
//! output vector.

use crate::config::ConfigError;
use crate::types::DeviceTarget;

/// Errors from context creation, allocation, kernel execution and config.
#[derive(Debug, thiserror::Error)]
pub enum SoftmaxError {
    /// No compatible device was found for the requested target.
    #[error("no compatible device for target '{target}': {reason}")]
    DeviceUnavailable { target: DeviceTarget, reason: String },

    /// A task instance faulted; the whole batch was aborted.
    #[error("kernel '{kernel}' faulted: {reason}")]
    ExecutionFault { kernel: String, reason: String },

    /// Device, host or shared memory could not be allocated.
    #[error("allocation of {requested_bytes} bytes failed: {reason}")]
    AllocationFailure { requested_bytes: usize, reason: String },

    /// Invalid launch geometry, buffer size or memory-space access.
    #[error("invalid argument: {reason}")]
    InvalidArguments { reason: String },

    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SoftmaxError {
    /// Shorthand for [`SoftmaxError::InvalidArguments`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArguments { reason: reason.into() }
    }

    /// Shorthand for [`SoftmaxError::ExecutionFault`].
    pub fn fault(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFault { kernel: kernel.into(), reason: reason.into() }
    }

    /// Whether this error came from a faulted task instance.
    pub fn is_execution_fault(&self) -> bool {
        matches!(self, Self::ExecutionFault { .. })
    }
}

/// Convenience result type for softmax-accel operations.
pub type Result<T> = std::result::Result<T, SoftmaxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_target_and_reason() {
        let err = SoftmaxError::DeviceUnavailable {
            target: DeviceTarget::Gpu,
            reason: "no GPU-class device registered".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'gpu'"), "{msg}");
        assert!(msg.contains("no GPU-class device"), "{msg}");
    }

    #[test]
    fn fault_shorthand_builds_execution_fault() {
        let err = SoftmaxError::fault("softmax_flat", "index 7 out of bounds for length 4");
        assert!(err.is_execution_fault());
        assert_eq!(
            err.to_string(),
            "kernel 'softmax_flat' faulted: index 7 out of bounds for length 4"
        );
    }

    #[test]
    fn allocation_failure_reports_bytes() {
        let err = SoftmaxError::AllocationFailure {
            requested_bytes: 4096,
            reason: "memory limit 1024 bytes exceeded".into(),
        };
        assert!(err.to_string().contains("4096 bytes"));
        assert!(!err.is_execution_fault());
    }

    #[test]
    fn config_errors_convert() {
        let err: SoftmaxError = ConfigError::Validation("group_size must be > 0".into()).into();
        assert!(matches!(err, SoftmaxError::Config(_)));
        assert!(err.to_string().contains("group_size"));
    }
}
