//! Memory residency strategies: how input and output reach the device and
//! how results come back to the host.
//!
//! Every strategy stages an input/output pair, lets a kernel bind views to
//! it, then retrieves the output after the compute has completed and
//! releases everything it allocated.

mod shared_managed;
mod staged_copy;
mod unified_explicit;
mod unified_implicit;

pub use shared_managed::SharedManaged;
pub use staged_copy::{MirroredBuffer, StagedCopy};
pub use unified_explicit::UnifiedExplicit;
pub use unified_implicit::UnifiedImplicit;

use crate::context::ExecutionContext;
use crate::event::Event;
use crate::memory::{AccessMode, DeviceAllocation, GlobalView};
use softmax_common::{ResidencyKind, Result};
use std::fmt;

/// A way of making data resident on the device.
pub trait ResidencyStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> ResidencyKind;

    /// Make `input` available to kernels and reserve an output of the same
    /// length.
    fn stage(&self, ctx: &ExecutionContext, input: &[f64]) -> Result<StagedPair>;

    /// Bring the output back to the host. Only called after the compute
    /// that wrote it was waited on.
    fn retrieve(&self, ctx: &ExecutionContext, staged: &StagedPair) -> Result<Vec<f64>>;

    /// Return every allocation made by `stage`.
    fn release(&self, ctx: &ExecutionContext, staged: StagedPair) -> Result<()> {
        let StagedPair { input, output, .. } = staged;
        let first = input.release(ctx);
        let second = output.release(ctx);
        first.and(second)
    }
}

/// Strategy implementation for `kind`.
pub fn strategy_for(kind: ResidencyKind) -> Box<dyn ResidencyStrategy> {
    match kind {
        ResidencyKind::StagedCopy => Box::new(StagedCopy),
        ResidencyKind::UnifiedImplicit => Box::new(UnifiedImplicit),
        ResidencyKind::UnifiedExplicit => Box::new(UnifiedExplicit),
        ResidencyKind::SharedManaged => Box::new(SharedManaged),
    }
}

/// Storage behind one staged vector.
#[derive(Debug)]
pub enum StagedHandle {
    /// Host vector with a runtime-managed device mirror.
    Mirrored(MirroredBuffer),
    /// One allocation valid on host and device.
    Unified(DeviceAllocation),
    /// Host allocation plus device allocation, copied explicitly.
    Split { host: DeviceAllocation, device: DeviceAllocation },
}

impl StagedHandle {
    /// Bind a kernel view of the device-side storage.
    pub fn bind(&self, mode: AccessMode) -> Result<GlobalView> {
        match self {
            Self::Mirrored(buffer) => buffer.device_access(mode),
            Self::Unified(alloc) => Ok(alloc.view(mode)),
            Self::Split { device, .. } => Ok(device.view(mode)),
        }
    }

    fn release(self, ctx: &ExecutionContext) -> Result<()> {
        match self {
            Self::Mirrored(_) => Ok(()),
            Self::Unified(alloc) if !alloc.requires_free() => Ok(()),
            Self::Unified(alloc) => ctx.free(alloc),
            Self::Split { host, device } => {
                let first = ctx.free(host);
                let second = ctx.free(device);
                first.and(second)
            }
        }
    }
}

/// Input and output staged by one residency strategy.
#[derive(Debug)]
pub struct StagedPair {
    kind: ResidencyKind,
    len: usize,
    input: StagedHandle,
    output: StagedHandle,
}

impl StagedPair {
    pub(crate) fn new(kind: ResidencyKind, len: usize, input: StagedHandle, output: StagedHandle) -> Self {
        Self { kind, len, input, output }
    }

    pub fn kind(&self) -> ResidencyKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read-only view of the input.
    pub fn input(&self) -> Result<GlobalView> {
        self.input.bind(AccessMode::Read)
    }

    pub fn output(&self, mode: AccessMode) -> Result<GlobalView> {
        self.output.bind(mode)
    }

    /// Record the last submission that writes the output; host retrieval
    /// of mirrored buffers waits for it.
    pub fn record_output_writer(&self, event: &Event) {
        if let StagedHandle::Mirrored(buffer) = &self.output {
            buffer.record_writer(event);
        }
    }

    pub fn output_handle(&self) -> &StagedHandle {
        &self.output
    }
}

/// Frees tracked allocations on drop unless disarmed.
///
/// Keeps partially built stagings and kernel scratch from leaking when a
/// later step fails.
#[derive(Debug)]
pub struct AllocationGuard<'c> {
    ctx: &'c ExecutionContext,
    allocations: Vec<DeviceAllocation>,
}

impl<'c> AllocationGuard<'c> {
    pub fn new(ctx: &'c ExecutionContext) -> Self {
        Self { ctx, allocations: Vec::new() }
    }

    /// Track `allocation` and hand it back.
    pub fn track(&mut self, allocation: DeviceAllocation) -> DeviceAllocation {
        self.allocations.push(allocation.clone());
        allocation
    }

    /// Stop tracking; ownership stays with the caller.
    pub fn disarm(mut self) {
        self.allocations.clear();
    }
}

impl Drop for AllocationGuard<'_> {
    fn drop(&mut self) {
        for allocation in self.allocations.drain(..) {
            if allocation.requires_free()
                && !allocation.is_freed()
                && let Err(err) = self.ctx.free(allocation)
            {
                tracing::debug!(%err, "guarded free failed");
            }
        }
    }
}
