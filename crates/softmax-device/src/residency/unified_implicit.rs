//! Unified allocations valid on both sides. The host writes and reads them
//! directly; pages migrate on first touch from either side.

use super::{ResidencyStrategy, StagedHandle, StagedPair};
use crate::context::ExecutionContext;
use softmax_common::{ResidencyKind, Result, SoftmaxError};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedImplicit;

impl ResidencyStrategy for UnifiedImplicit {
    fn kind(&self) -> ResidencyKind {
        ResidencyKind::UnifiedImplicit
    }

    fn stage(&self, ctx: &ExecutionContext, input: &[f64]) -> Result<StagedPair> {
        let staged_input = ctx.malloc_unified(input.len(), "unified_input")?;
        staged_input.host_write(input)?;
        let staged_output = ctx.malloc_unified(input.len(), "unified_output")?;
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
                "unified-implicit cannot retrieve a {} staging",
                staged.kind()
            ))),
        }
    }
}
