//! Host-mirrored buffers. Transfers are implicit and happen at access
//! boundaries: binding a readable view uploads a stale device mirror, and
//! reading on the host waits for the last writer and downloads.

use super::{ResidencyStrategy, StagedHandle, StagedPair};
use crate::context::ExecutionContext;
use crate::event::Event;
use crate::memory::{AccessMode, DeviceAllocation, GlobalView};
use softmax_common::{ResidencyKind, Result, SoftmaxError};
use std::sync::Mutex;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coherence {
    HostNewer,
    DeviceNewer,
    Coherent,
}

#[derive(Debug)]
struct MirrorState {
    host: Vec<f64>,
    coherence: Coherence,
    last_writer: Option<Event>,
}

/// A host vector with a device mirror kept coherent by the runtime.
#[derive(Debug)]
pub struct MirroredBuffer {
    device: DeviceAllocation,
    state: Mutex<MirrorState>,
}

impl MirroredBuffer {
    pub fn new(ctx: &ExecutionContext, host: Vec<f64>, label: &str) -> Result<Self> {
        let device = ctx.malloc_runtime_device(host.len(), label)?;
        Ok(Self {
            device,
            state: Mutex::new(MirrorState { host, coherence: Coherence::HostNewer, last_writer: None }),
        })
    }

    pub fn len(&self) -> usize {
        self.device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.device.is_empty()
    }

    /// Bind a device view, uploading first if the host copy is newer.
    /// A writable view marks the host copy stale.
    pub fn device_access(&self, mode: AccessMode) -> Result<GlobalView> {
        let mut state = self.state.lock().expect("mirror lock poisoned");
        if mode.can_read() && state.coherence == Coherence::HostNewer {
            self.device.store_all(&state.host);
            self.device.tracker().record_transfer(self.device.byte_len() as usize, false);
            state.coherence = Coherence::Coherent;
            trace!(label = self.device.label(), "uploaded mirror");
        }
        if mode.can_write() {
            state.coherence = Coherence::DeviceNewer;
        }
        Ok(self.device.view(mode))
    }

    pub(crate) fn record_writer(&self, event: &Event) {
        self.state.lock().expect("mirror lock poisoned").last_writer = Some(event.clone());
    }

    /// Host copy of the data, after the last recorded writer completed.
    ///
    /// # Errors
    ///
    /// Propagates the writer's fault.
    pub fn host_read(&self) -> Result<Vec<f64>> {
        let writer = self.state.lock().expect("mirror lock poisoned").last_writer.take();
        if let Some(event) = writer {
            event.wait()?;
        }
        let mut state = self.state.lock().expect("mirror lock poisoned");
        if state.coherence == Coherence::DeviceNewer {
            state.host = self.device.load_all();
            self.device.tracker().record_transfer(self.device.byte_len() as usize, false);
            state.coherence = Coherence::Coherent;
            trace!(label = self.device.label(), "downloaded mirror");
        }
        Ok(state.host.clone())
    }
}

/// Residency through [`MirroredBuffer`]s; no explicit copies or frees.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedCopy;

impl ResidencyStrategy for StagedCopy {
    fn kind(&self) -> ResidencyKind {
        ResidencyKind::StagedCopy
    }

    fn stage(&self, ctx: &ExecutionContext, input: &[f64]) -> Result<StagedPair> {
        let input_buf = MirroredBuffer::new(ctx, input.to_vec(), "staged_input")?;
        let output_buf = MirroredBuffer::new(ctx, vec![0.0; input.len()], "staged_output")?;
        Ok(StagedPair::new(
            self.kind(),
            input.len(),
            StagedHandle::Mirrored(input_buf),
            StagedHandle::Mirrored(output_buf),
        ))
    }

    fn retrieve(&self, _ctx: &ExecutionContext, staged: &StagedPair) -> Result<Vec<f64>> {
        match staged.output_handle() {
            StagedHandle::Mirrored(buffer) => buffer.host_read(),
            _ => Err(SoftmaxError::invalid(format!(
                "staged-copy cannot retrieve a {} staging",
                staged.kind()
            ))),
        }
    }
}
