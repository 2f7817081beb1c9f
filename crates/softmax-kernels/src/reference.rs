//! Sequential host softmax, the oracle every device strategy is checked
//! against.

use crate::reduction::{ReductionOp, reduce};

/// `exp(x_i) / Σ exp(x_j)`, exponentials computed once and summed in
/// index order. No max subtraction: large logits overflow exactly as the
/// unstabilized formula does.
pub fn softmax(input: &[f64]) -> Vec<f64> {
    softmax_shifted(input, 0.0)
}

/// Softmax of `x - shift`. A zero shift is bit-identical to [`softmax`].
pub fn softmax_shifted(input: &[f64], shift: f64) -> Vec<f64> {
    let exps: Vec<f64> = input.iter().map(|&x| (x - shift).exp()).collect();
    let denominator: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / denominator).collect()
}

/// Max-subtracted softmax; finite for any finite input.
pub fn softmax_stable(input: &[f64]) -> Vec<f64> {
    if input.is_empty() {
        return Vec::new();
    }
    softmax_shifted(input, reduce(input, ReductionOp::Max))
}
