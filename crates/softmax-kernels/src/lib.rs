//! Softmax kernels and per-strategy evaluation.
//!
//! # Strategies
//!
//! | strategy | residency | kernel |
//! |----------|-----------|--------|
//! | `Sequential` | host | [`reference::softmax`] |
//! | `StagedCopy` | mirrored buffers | flat |
//! | `UnifiedImplicit` | unified, migrating pages | flat |
//! | `UnifiedExplicit` | host + device, explicit copies | flat |
//! | `SharedManaged` | shared, explicit release | flat |
//! | `TiledGroup` | configured | tiled two-phase reduction |
//!
//! The flat family is either the naive O(N²) baseline, where every task
//! recomputes the denominator, or the default multi-pass reduction. By
//! default no max subtraction happens; `numerically_stable = true` adds a
//! device max reduction and shifts every logit by it.
//!
//! ```no_run
//! use softmax_common::Strategy;
//!
//! let probs = softmax_kernels::evaluate(Strategy::TiledGroup, &[1.0, 2.0, 3.0])?;
//! assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
//! # Ok::<(), softmax_common::SoftmaxError>(())
//! ```

pub mod evaluator;
pub mod flat;
pub mod reduction;
pub mod reference;
pub mod tiled;

pub use evaluator::{Evaluation, SoftmaxEvaluator, evaluate};
pub use reduction::{DeviceReduction, ReductionOp, Shift, launch_reduce, reduce, tree_reduce};
