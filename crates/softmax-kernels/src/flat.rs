//! Flat kernels: one task instance per output element.

use crate::reduction::Shift;
use softmax_common::Result;
use softmax_device::{AccessMode, AllocationGuard, Event, ExecutionContext, StagedPair};
use tracing::debug;

pub const NAIVE_KERNEL: &str = "softmax_flat_naive";

/// Naive baseline: every task recomputes the full denominator.
///
/// O(N²) total work. Summation runs in index order, so with a zero shift
/// the output is bit-identical to the sequential reference.
pub fn launch_naive(
    ctx: &ExecutionContext,
    staged: &StagedPair,
    shift: &Shift,
    deps: &[Event],
) -> Result<Event> {
    let n = staged.len();
    let input = staged.input()?;
    let output = staged.output(AccessMode::Write)?;
    let shift = shift.clone();
    debug!(n, "launching naive flat softmax");

    ctx.launch(NAIVE_KERNEL).after_all(deps).parallel_for(n, move |item| {
        let s = shift.get()?;
        let mut denominator = 0.0;
        for j in 0..n {
            denominator += (input.read(j)? - s).exp();
        }
        output.write(item.id, (input.read(item.id)? - s).exp() / denominator)
    })
}

/// Multi-pass flat softmax.
///
/// 1. `softmax_exp`: exp of every element into the output buffer.
/// 2. `softmax_partial_sums`: one task per chunk of `chunk` elements,
///    partial sums into a scratch region indexed by chunk id.
/// 3. `softmax_combine`: a single task sums the partials in chunk order.
/// 4. `softmax_normalize`: divides every element by the denominator.
///
/// Each step is declared to depend on the previous one, so the result is
/// the same on in-order and unordered queues.
pub fn launch_reduced(
    ctx: &ExecutionContext,
    staged: &StagedPair,
    shift: &Shift,
    chunk: usize,
    deps: &[Event],
    scratch: &mut AllocationGuard<'_>,
) -> Result<Event> {
    let n = staged.len();
    let chunks = n.div_ceil(chunk);
    let input = staged.input()?;
    let exps = staged.output(AccessMode::ReadWrite)?;
    let partials = scratch.track(ctx.malloc_device(chunks, "flat_partials")?);
    let denominator = scratch.track(ctx.malloc_device(1, "flat_denominator")?);
    debug!(n, chunk, chunks, "launching reduced flat softmax");

    let exp_done = {
        let exps = exps.clone();
        let shift = shift.clone();
        ctx.launch("softmax_exp").after_all(deps).parallel_for(n, move |item| {
            let s = shift.get()?;
            exps.write(item.id, (input.read(item.id)? - s).exp())
        })?
    };

    let partials_done = {
        let exps = exps.clone();
        let sink = partials.view(AccessMode::Write);
        ctx.launch("softmax_partial_sums").after(&exp_done).parallel_for(chunks, move |item| {
            let start = item.id * chunk;
            let end = (start + chunk).min(n);
            let mut acc = 0.0;
            for i in start..end {
                acc += exps.read(i)?;
            }
            sink.write(item.id, acc)
        })?
    };

    let combined = {
        let partials = partials.view(AccessMode::Read);
        let out = denominator.view(AccessMode::Write);
        ctx.launch("softmax_combine").after(&partials_done).single_task(move || {
            let mut acc = 0.0;
            for c in 0..chunks {
                acc += partials.read(c)?;
            }
            out.write(0, acc)
        })?
    };

    let denominator = denominator.view(AccessMode::Read);
    ctx.launch("softmax_normalize").after(&combined).parallel_for(n, move |item| {
        let d = denominator.read(0)?;
        let e = exps.read(item.id)?;
        exps.write(item.id, e / d)
    })
}
