//! Per-strategy softmax evaluation on one execution context.

use crate::reduction::{ReductionOp, Shift, launch_reduce};
use crate::{flat, reference, tiled};
use softmax_common::{
    KernelVariant, ResidencyKind, Result, SoftmaxConfig, Strategy, probability_sum,
};
use softmax_device::{
    AllocationGuard, Event, ExecutionContext, StagedPair, strategy_for,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output of one timed evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub strategy: Strategy,
    pub output: Vec<f64>,
    /// Sum of the outputs; 1.0 within tolerance for a valid result.
    pub checksum: f64,
    pub elapsed: Duration,
    /// Device the evaluation ran on (`"host-reference"` for the sequential path).
    pub device: String,
}

/// Evaluates softmax with every strategy on a shared execution context.
///
/// The context is created once and reused; no numeric state survives
/// between calls.
#[derive(Debug)]
pub struct SoftmaxEvaluator {
    config: SoftmaxConfig,
    ctx: ExecutionContext,
}

impl SoftmaxEvaluator {
    /// # Errors
    ///
    /// Invalid configuration or [`SoftmaxError::DeviceUnavailable`](softmax_common::SoftmaxError::DeviceUnavailable).
    pub fn new(config: SoftmaxConfig) -> Result<Self> {
        config.validate()?;
        let ctx = ExecutionContext::from_config(&config)?;
        Ok(Self { config, ctx })
    }

    pub fn config(&self) -> &SoftmaxConfig {
        &self.config
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn sequential(&self, input: &[f64]) -> Result<Vec<f64>> {
        Ok(if self.config.numerically_stable {
            reference::softmax_stable(input)
        } else {
            reference::softmax(input)
        })
    }

    pub fn staged_copy(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.flat(ResidencyKind::StagedCopy, input)
    }

    pub fn unified_implicit(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.flat(ResidencyKind::UnifiedImplicit, input)
    }

    pub fn unified_explicit(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.flat(ResidencyKind::UnifiedExplicit, input)
    }

    pub fn shared_managed(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.flat(ResidencyKind::SharedManaged, input)
    }

    /// Tiled kernel over the configured residency.
    pub fn tiled_group(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.on_device(self.config.residency, input, |ctx, staged, shift, deps, scratch| {
            tiled::launch_tiled(
                ctx,
                staged,
                shift,
                self.config.group_size,
                self.config.combine,
                deps,
                scratch,
            )
        })
    }

    pub fn evaluate_with(&self, strategy: Strategy, input: &[f64]) -> Result<Vec<f64>> {
        match strategy {
            Strategy::Sequential => self.sequential(input),
            Strategy::StagedCopy => self.staged_copy(input),
            Strategy::UnifiedImplicit => self.unified_implicit(input),
            Strategy::UnifiedExplicit => self.unified_explicit(input),
            Strategy::SharedManaged => self.shared_managed(input),
            Strategy::TiledGroup => self.tiled_group(input),
        }
    }

    /// Evaluate with the configured strategy and time it.
    pub fn evaluate(&self, input: &[f64]) -> Result<Evaluation> {
        self.evaluate_timed(self.config.strategy, input)
    }

    pub fn evaluate_timed(&self, strategy: Strategy, input: &[f64]) -> Result<Evaluation> {
        let start = Instant::now();
        let output = self.evaluate_with(strategy, input)?;
        let elapsed = start.elapsed();
        let checksum = probability_sum(&output);
        let device = if strategy.uses_device() {
            self.ctx.device().name.clone()
        } else {
            "host-reference".to_string()
        };
        info!(%strategy, n = input.len(), checksum, elapsed_us = elapsed.as_micros() as u64, "evaluated");
        Ok(Evaluation { strategy, output, checksum, elapsed, device })
    }

    fn flat(&self, kind: ResidencyKind, input: &[f64]) -> Result<Vec<f64>> {
        self.on_device(kind, input, |ctx, staged, shift, deps, scratch| match self.config.kernel_variant {
            KernelVariant::Naive => flat::launch_naive(ctx, staged, shift, deps),
            KernelVariant::Reduced => flat::launch_reduced(
                ctx,
                staged,
                shift,
                self.config.reduction_chunk,
                deps,
                scratch,
            ),
        })
    }

    /// Stage, compute, retrieve, release. Staged data is released even when
    /// the compute faulted; the compute error wins over a release error.
    fn on_device<F>(&self, kind: ResidencyKind, input: &[f64], launch: F) -> Result<Vec<f64>>
    where
        F: FnOnce(
            &ExecutionContext,
            &StagedPair,
            &Shift,
            &[Event],
            &mut AllocationGuard<'_>,
        ) -> Result<Event>,
    {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let strategy = strategy_for(kind);
        let staged = strategy.stage(&self.ctx, input)?;
        debug!(residency = %kind, n = input.len(), "staged");

        let output = self
            .compute(&staged, launch)
            .and_then(|()| strategy.retrieve(&self.ctx, &staged));
        let released = strategy.release(&self.ctx, staged);
        let output = output?;
        released?;
        Ok(output)
    }

    fn compute<F>(&self, staged: &StagedPair, launch: F) -> Result<()>
    where
        F: FnOnce(
            &ExecutionContext,
            &StagedPair,
            &Shift,
            &[Event],
            &mut AllocationGuard<'_>,
        ) -> Result<Event>,
    {
        let ctx = &self.ctx;
        let mut scratch = AllocationGuard::new(ctx);

        let submitted = self.shift(staged, &mut scratch).and_then(|(shift, deps)| {
            launch(ctx, staged, &shift, &deps, &mut scratch)
        });
        let last = match submitted {
            Ok(event) => event,
            Err(err) => {
                // Earlier launches may still reference scratch.
                if let Err(fault) = ctx.wait_all() {
                    warn!(%fault, %err, "earlier launch faulted before a failed submission");
                }
                return Err(err);
            }
        };
        staged.record_output_writer(&last);
        ctx.wait(&last)
    }

    fn shift(
        &self,
        staged: &StagedPair,
        scratch: &mut AllocationGuard<'_>,
    ) -> Result<(Shift, Vec<Event>)> {
        if !self.config.numerically_stable {
            return Ok((Shift::Zero, Vec::new()));
        }
        let max = launch_reduce(
            &self.ctx,
            staged.input()?,
            staged.len(),
            ReductionOp::Max,
            self.config.group_size,
            &[],
            scratch,
        )?;
        Ok((max.as_shift(), vec![max.event]))
    }
}

/// Evaluate with a default-configured evaluator.
///
/// # Errors
///
/// See [`SoftmaxEvaluator::new`] and [`SoftmaxEvaluator::evaluate_with`].
pub fn evaluate(strategy: Strategy, input: &[f64]) -> Result<Vec<f64>> {
    SoftmaxEvaluator::new(SoftmaxConfig::default())?.evaluate_with(strategy, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use softmax_common::{CombineMode, DeviceTarget, SoftmaxError};

    fn cpu_config() -> SoftmaxConfig {
        SoftmaxConfig { target: DeviceTarget::Cpu, threads: 2, ..SoftmaxConfig::default() }
    }

    #[test]
    fn invalid_config_is_rejected_before_context_creation() {
        let err = SoftmaxEvaluator::new(SoftmaxConfig { group_size: 0, ..cpu_config() }).unwrap_err();
        assert!(matches!(err, SoftmaxError::Config(_)));
    }

    #[test]
    fn evaluation_reports_checksum_and_device() {
        let evaluator = SoftmaxEvaluator::new(cpu_config()).unwrap();
        let eval = evaluator.evaluate_timed(Strategy::TiledGroup, &[1.0, 2.0, 3.0]).unwrap();
        assert!((eval.checksum - 1.0).abs() < 1e-12);
        assert_eq!(eval.device, "host-cpu");
        assert_eq!(eval.strategy, Strategy::TiledGroup);

        let seq = evaluator.evaluate_timed(Strategy::Sequential, &[1.0]).unwrap();
        assert_eq!(seq.device, "host-reference");
        assert_eq!(seq.output, vec![1.0]);
    }

    #[test]
    fn evaluate_uses_configured_strategy() {
        let config = cpu_config().with_strategy(Strategy::UnifiedExplicit);
        let evaluator = SoftmaxEvaluator::new(config).unwrap();
        assert_eq!(evaluator.evaluate(&[0.0, 0.0]).unwrap().strategy, Strategy::UnifiedExplicit);
    }

    #[test]
    fn scratch_and_staging_are_released() {
        for combine in [CombineMode::TwoPass, CombineMode::Atomic] {
            let evaluator = SoftmaxEvaluator::new(SoftmaxConfig {
                combine,
                numerically_stable: true,
                ..cpu_config()
            })
            .unwrap();
            let input: Vec<f64> = (0..300).map(f64::from).collect();
            for strategy in Strategy::ALL {
                evaluator.evaluate_with(strategy, &input).unwrap();
            }
            let stats = evaluator.context().memory_stats();
            assert_eq!(stats.live_allocations, 0);
            assert_eq!(stats.leaked_allocations, 0);
        }
    }
}
