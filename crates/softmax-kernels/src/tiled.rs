//! Work-group tiled softmax with a genuine two-phase reduction.
//!
//! Phase 1 (`tiled_group_sums`): every item of a group of G stages its
//! exponential in local memory (padding items past N stage 0.0 and never
//! touch global memory) and writes it to the output buffer. After a
//! barrier the group tree-reduces its slots to one partial.
//!
//! Phase 2 combines the partials into one denominator, either through a
//! scratch region indexed by group id plus a single combine task
//! ([`CombineMode::TwoPass`]) or with a relaxed atomic add into a zeroed
//! scalar ([`CombineMode::Atomic`]).
//!
//! Normalization is a separate launch, so every task reads the complete
//! denominator.

use crate::reduction::{ReductionOp, Shift, tree_reduce};
use softmax_common::{CombineMode, Result};
use softmax_device::{
    AccessMode, AllocationGuard, Event, ExecutionContext, GlobalView, KernelResult, NdRange,
    StagedPair,
};
use tracing::debug;

pub const GROUP_SUMS_KERNEL: &str = "tiled_group_sums";

/// Where phase 1 puts each group's partial.
#[derive(Debug, Clone)]
enum PartialSink {
    Slots(GlobalView),
    Atomic(GlobalView),
}

impl PartialSink {
    fn store(&self, group_id: usize, partial: f64) -> KernelResult<()> {
        match self {
            Self::Slots(view) => view.write(group_id, partial),
            Self::Atomic(view) => view.fetch_add(0, partial).map(|_| ()),
        }
    }
}

/// Launch the tiled kernel over a staged pair.
///
/// # Errors
///
/// Invalid group geometry, scratch allocation failure, or a group size
/// the device cannot host.
pub fn launch_tiled(
    ctx: &ExecutionContext,
    staged: &StagedPair,
    shift: &Shift,
    group_size: usize,
    combine: CombineMode,
    deps: &[Event],
    scratch: &mut AllocationGuard<'_>,
) -> Result<Event> {
    let n = staged.len();
    let range = NdRange::new(n, group_size)?;
    let groups = range.num_groups();
    let input = staged.input()?;
    let exps = staged.output(AccessMode::ReadWrite)?;
    let denominator = scratch.track(ctx.malloc_device(1, "tiled_denominator")?);
    debug!(n, group_size, groups, %combine, uniform = range.is_uniform(), "launching tiled softmax");

    let reduced = match combine {
        CombineMode::TwoPass => {
            let partials = scratch.track(ctx.malloc_device(groups, "tiled_partials")?);
            let sink = PartialSink::Slots(partials.view(AccessMode::Write));
            let sums = launch_group_sums(ctx, range, input, exps.clone(), shift.clone(), sink, deps)?;

            let partials = partials.view(AccessMode::Read);
            let out = denominator.view(AccessMode::Write);
            ctx.launch("tiled_combine").after(&sums).single_task(move || {
                let mut acc = 0.0;
                for g in 0..groups {
                    acc += partials.read(g)?;
                }
                out.write(0, acc)
            })?
        }
        CombineMode::Atomic => {
            let zeroed =
                ctx.launch("tiled_zero_denominator").after_all(deps).fill(&denominator, 0.0)?;
            let sink = PartialSink::Atomic(denominator.view(AccessMode::ReadWrite));
            launch_group_sums(ctx, range, input, exps.clone(), shift.clone(), sink, &[zeroed])?
        }
    };

    let denominator = denominator.view(AccessMode::Read);
    ctx.launch("tiled_normalize").after(&reduced).parallel_for(n, move |item| {
        let d = denominator.read(0)?;
        let e = exps.read(item.id)?;
        exps.write(item.id, e / d)
    })
}

fn launch_group_sums(
    ctx: &ExecutionContext,
    range: NdRange,
    input: GlobalView,
    exps: GlobalView,
    shift: Shift,
    sink: PartialSink,
    deps: &[Event],
) -> Result<Event> {
    ctx.launch(GROUP_SUMS_KERNEL).after_all(deps).parallel_for_work_group(range, move |group| {
        let s = shift.get()?;
        group.for_each_item(|item, local| {
            let staged = if item.in_bounds() {
                let e = (input.read(item.global_id)? - s).exp();
                exps.write(item.global_id, e)?;
                e
            } else {
                0.0
            };
            local.write(item.local_id, staged)
        })?;
        group.barrier();
        let partial = tree_reduce(group, ReductionOp::Sum)?;
        sink.store(group.group_id(), partial)
    })
}
