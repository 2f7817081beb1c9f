//! Emulated accelerator runtime.
//!
//! An [`ExecutionContext`] binds one probed device and owns an asynchronous
//! work queue backed by a rayon pool (one worker per compute unit). Kernels
//! are submitted through [`LaunchBuilder`] as flat `parallel_for` launches,
//! hierarchical work-group launches with barriers and local memory, single
//! tasks, copies and fills. Each submission returns an [`Event`].
//!
//! Memory comes in four spaces ([`MemorySpace`]) whose access rules are
//! enforced: kernels fault on host-only memory, the host cannot read
//! device-only memory, and explicit allocations must be freed. The
//! [`residency`] module builds the four data-residency strategies on top.

pub mod context;
pub mod event;
pub mod memory;
pub mod probe;
pub mod residency;
pub mod work_group;

pub use context::{ContextBuilder, ExecutionContext, LaunchBuilder};
pub use event::{Event, EventStatus};
pub use memory::{
    AccessMode, DeviceAllocation, GlobalView, KernelFault, KernelResult, MemorySpace, MemoryStats,
};
pub use probe::{DeviceInfo, DeviceKind, probe_cpu, probe_devices, select_device};
pub use residency::{AllocationGuard, ResidencyStrategy, StagedHandle, StagedPair, strategy_for};
pub use work_group::{Item, LocalMemory, NdItem, NdRange, WorkGroup};
