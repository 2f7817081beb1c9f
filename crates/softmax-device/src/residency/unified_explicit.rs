//! Host allocation plus device-only allocation per vector, moved with
//! explicit `memcpy` submissions. Copy-in completes before `stage` returns;
//! copy-out runs in `retrieve`, after the compute was waited on.

use super::{AllocationGuard, ResidencyStrategy, StagedHandle, StagedPair};
use crate::context::ExecutionContext;
use softmax_common::{ResidencyKind, Result, SoftmaxError};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedExplicit;

impl ResidencyStrategy for UnifiedExplicit {
    fn kind(&self) -> ResidencyKind {
        ResidencyKind::UnifiedExplicit
    }

    fn stage(&self, ctx: &ExecutionContext, input: &[f64]) -> Result<StagedPair> {
        let len = input.len();
        let mut guard = AllocationGuard::new(ctx);
        let host_in = guard.track(ctx.malloc_host(len, "explicit_host_input")?);
        let device_in = guard.track(ctx.malloc_device(len, "explicit_device_input")?);
        let host_out = guard.track(ctx.malloc_host(len, "explicit_host_output")?);
        let device_out = guard.track(ctx.malloc_device(len, "explicit_device_output")?);

        host_in.host_write(input)?;
        let copy_in = ctx.launch("copy_in").memcpy(&device_in, &host_in)?;
        ctx.wait(&copy_in)?;
        debug!(len, "input copied to device");

        guard.disarm();
        Ok(StagedPair::new(
            self.kind(),
            len,
            StagedHandle::Split { host: host_in, device: device_in },
            StagedHandle::Split { host: host_out, device: device_out },
        ))
    }

    fn retrieve(&self, ctx: &ExecutionContext, staged: &StagedPair) -> Result<Vec<f64>> {
        let StagedHandle::Split { host, device } = staged.output_handle() else {
            return Err(SoftmaxError::invalid(format!(
                "unified-explicit cannot retrieve a {} staging",
                staged.kind()
            )));
        };
        let copy_out = ctx.launch("copy_out").memcpy(host, device)?;
        ctx.wait(&copy_out)?;
        host.host_read()
    }
}
