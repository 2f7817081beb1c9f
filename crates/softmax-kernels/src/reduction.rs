//! Sum and max reductions, on the host and on the device.
//!
//! # Device strategy
//!
//! The device path is a two-phase reduction:
//!
//! 1. Each work group stages one element per item in local memory (padding
//!    items stage the identity), then runs a tree reduction with a barrier
//!    per level and writes its partial into a scratch slot indexed by group
//!    id.
//! 2. A single task folds the partials, in group order, into one scalar.
//!
//! The same in-group tree ([`tree_reduce`]) backs the tiled softmax kernel.

use softmax_common::Result;
use softmax_device::{
    AccessMode, AllocationGuard, DeviceAllocation, Event, ExecutionContext, GlobalView,
    KernelResult, NdRange, WorkGroup,
};

/// Which reduction to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionOp {
    Sum,
    Max,
}

impl ReductionOp {
    /// Identity element, also staged by masked items.
    pub fn identity(self) -> f64 {
        match self {
            Self::Sum => 0.0,
            Self::Max => f64::NEG_INFINITY,
        }
    }

    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Sum => a + b,
            Self::Max => a.max(b),
        }
    }

    fn kernel_prefix(self) -> &'static str {
        match self {
            Self::Sum => "reduce_sum",
            Self::Max => "reduce_max",
        }
    }
}

/// Reduce a slice on the host, left to right.
///
/// Returns the identity for an empty slice.
pub fn reduce(data: &[f64], op: ReductionOp) -> f64 {
    data.iter().fold(op.identity(), |acc, &x| op.combine(acc, x))
}

/// Tree-reduce the group's local memory into slot 0 and return it.
///
/// Every slot must already be staged and published by a barrier. Each
/// level pairs `lid` with `lid + stride` and ends with a barrier, so the
/// group size need not be a power of two.
pub fn tree_reduce(group: &mut WorkGroup, op: ReductionOp) -> KernelResult<f64> {
    let size = group.group_size();
    let mut stride = size.next_power_of_two() / 2;
    while stride > 0 {
        group.for_each_item(|item, local| {
            let lid = item.local_id;
            if lid < stride && lid + stride < size {
                let combined = op.combine(local.read(lid)?, local.read(lid + stride)?);
                local.write(lid, combined)?;
            }
            Ok(())
        })?;
        group.barrier();
        stride /= 2;
    }
    group.local().read(0)
}

/// A reduction in flight; `result` holds one element once `event` completes.
#[derive(Debug)]
pub struct DeviceReduction {
    pub event: Event,
    pub result: DeviceAllocation,
}

/// Reduce the first `len` elements of `source` on the device.
///
/// Scratch and the result scalar are tracked by `scratch`; they stay valid
/// until the guard drops.
///
/// # Errors
///
/// Propagates allocation failures and invalid launch geometry.
pub fn launch_reduce(
    ctx: &ExecutionContext,
    source: GlobalView,
    len: usize,
    op: ReductionOp,
    group_size: usize,
    deps: &[Event],
    scratch: &mut AllocationGuard<'_>,
) -> Result<DeviceReduction> {
    let range = NdRange::new(len, group_size)?;
    let groups = range.num_groups();
    let prefix = op.kernel_prefix();
    let partials = scratch.track(ctx.malloc_device(groups, &format!("{prefix}_partials"))?);
    let result = scratch.track(ctx.malloc_device(1, &format!("{prefix}_result"))?);

    let sink = partials.view(AccessMode::Write);
    let groups_done = ctx
        .launch(&format!("{prefix}_groups"))
        .after_all(deps)
        .parallel_for_work_group(range, move |group| {
            group.for_each_item(|item, local| {
                let value =
                    if item.in_bounds() { source.read(item.global_id)? } else { op.identity() };
                local.write(item.local_id, value)
            })?;
            group.barrier();
            let partial = tree_reduce(group, op)?;
            sink.write(group.group_id(), partial)
        })?;

    let partial_view = partials.view(AccessMode::Read);
    let out = result.view(AccessMode::Write);
    let event = ctx.launch(&format!("{prefix}_combine")).after(&groups_done).single_task(move || {
        let mut acc = op.identity();
        for g in 0..groups {
            acc = op.combine(acc, partial_view.read(g)?);
        }
        out.write(0, acc)
    })?;

    Ok(DeviceReduction { event, result })
}

/// Value subtracted from every logit before exponentiation.
#[derive(Debug, Clone)]
pub enum Shift {
    /// No stabilization; `x - 0.0` is exactly `x`.
    Zero,
    /// Scalar produced on the device, usually by a max reduction.
    Device(GlobalView),
}

impl Shift {
    /// Read the shift from inside a task.
    pub fn get(&self) -> KernelResult<f64> {
        match self {
            Self::Zero => Ok(0.0),
            Self::Device(view) => view.read(0),
        }
    }
}

impl DeviceReduction {
    /// Use the reduced scalar as a shift.
    pub fn as_shift(&self) -> Shift {
        Shift::Device(self.result.view(AccessMode::Read))
    }
}
