//! Explicitly allocated shared memory. No copy calls are issued; both
//! allocations must be returned through `release`.

use super::{AllocationGuard, ResidencyStrategy, StagedHandle, StagedPair};
use crate::context::ExecutionContext;
use softmax_common::{ResidencyKind, Result, SoftmaxError};

#[derive(Debug, Clone, Copy, Default)]
pub struct SharedManaged;

impl ResidencyStrategy for SharedManaged {
    fn kind(&self) -> ResidencyKind {
        ResidencyKind::SharedManaged
    }

    fn stage(&self, ctx: &ExecutionContext, input: &[f64]) -> Result<StagedPair> {
        let mut guard = AllocationGuard::new(ctx);
        let staged_input = guard.track(ctx.malloc_shared(input.len(), "shared_input")?);
        staged_input.host_write(input)?;
        let staged_output = guard.track(ctx.malloc_shared(input.len(), "shared_output")?);
        guard.disarm();
        Ok(StagedPair::new(
            self.kind(),
            input.len(),
            StagedHandle::Unified(staged_input),
            StagedHandle::Unified(staged_output),
        ))
    }

    fn retrieve(&self, _ctx: &ExecutionContext, staged: &StagedPair) -> Result<Vec<f64>> {
        match staged.output_handle() {
            StagedHandle::Unified(alloc) => alloc.host_read(),
            _ => Err(SoftmaxError::invalid(format!(
                "shared-managed cannot retrieve a {} staging",
                staged.kind()
            ))),
        }
    }
}
