//! Probability-distribution checks applied to every strategy's output.

use crate::error::{Result, SoftmaxError};

/// Default relative tolerance on the output sum.
pub const SUM_TOLERANCE: f64 = 1e-6;

/// Summary of an output vector checked as a probability distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistributionReport {
    /// Sum of all outputs (the checksum reported to callers).
    pub sum: f64,
    /// Smallest output value.
    pub min: f64,
    /// Largest output value.
    pub max: f64,
    /// Number of elements checked.
    pub len: usize,
}

/// Sum of the outputs, accumulated in index order.
pub fn probability_sum(output: &[f64]) -> f64 {
    output.iter().sum()
}

/// Check that `output` is a probability vector: every value in `(0, 1]`
/// and the sum within `tolerance` (relative) of 1.0.
///
/// An empty vector is accepted and reports a zero sum.
///
/// # Errors
///
/// Returns [`SoftmaxError::InvalidArguments`] naming the first violation.
pub fn validate_distribution(output: &[f64], tolerance: f64) -> Result<DistributionReport> {
    if output.is_empty() {
        return Ok(DistributionReport { sum: 0.0, min: 0.0, max: 0.0, len: 0 });
    }

    if let Some((i, v)) = output.iter().enumerate().find(|(_, v)| !(**v > 0.0 && **v <= 1.0)) {
        return Err(SoftmaxError::invalid(format!("output[{i}] = {v} is outside (0, 1]")));
    }

    let sum = probability_sum(output);
    if (sum - 1.0).abs() > tolerance {
        return Err(SoftmaxError::invalid(format!(
            "probability sum {sum} deviates from 1.0 by more than {tolerance}"
        )));
    }

    let min = output.iter().copied().fold(f64::INFINITY, f64::min);
    let max = output.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok(DistributionReport { sum, min, max, len: output.len() })
}

/// Largest element-wise absolute difference between two vectors.
///
/// Returns `f64::INFINITY` when the lengths differ.
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_distribution_is_valid() {
        let report = validate_distribution(&[0.25; 4], SUM_TOLERANCE).unwrap();
        assert_eq!(report.len, 4);
        assert!((report.sum - 1.0).abs() < 1e-15);
        assert_eq!(report.min, 0.25);
        assert_eq!(report.max, 0.25);
    }

    #[test]
    fn single_element_one_is_valid() {
        assert!(validate_distribution(&[1.0], SUM_TOLERANCE).is_ok());
    }

    #[test]
    fn empty_output_is_valid() {
        let report = validate_distribution(&[], SUM_TOLERANCE).unwrap();
        assert_eq!(report.len, 0);
        assert_eq!(report.sum, 0.0);
    }

    #[test]
    fn nan_is_rejected() {
        let err = validate_distribution(&[0.5, f64::NAN], SUM_TOLERANCE).unwrap_err();
        assert!(err.to_string().contains("output[1]"));
    }

    #[test]
    fn bad_sum_is_rejected() {
        let err = validate_distribution(&[0.5, 0.6], SUM_TOLERANCE).unwrap_err();
        assert!(err.to_string().contains("probability sum"));
    }

    #[test]
    fn max_abs_diff_handles_length_mismatch() {
        assert_eq!(max_abs_diff(&[0.1, 0.2], &[0.1, 0.25]), 0.25 - 0.2);
        assert!(max_abs_diff(&[0.1], &[0.1, 0.2]).is_infinite());
    }
}
