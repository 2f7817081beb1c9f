//! Host, device, shared and unified allocations with enforced access rules.
//!
//! Every allocation is a run of `f64` cells stored as `AtomicU64` bit
//! patterns so that task instances on different compute units can write
//! distinct indices (and atomically accumulate into shared scalars) without
//! `unsafe`. The memory space decides who may touch the cells:
//!
//! | space     | host access | device access | release            |
//! |-----------|-------------|---------------|--------------------|
//! | `Host`    | yes         | faults        | explicit `free`    |
//! | `Device`  | rejected    | yes           | explicit `free`    |
//! | `Shared`  | yes         | yes           | explicit `free`    |
//! | `Unified` | yes (pages migrate) | yes (pages migrate) | on drop |
//!
//! Explicit allocations dropped without `free` are counted as leaked in
//! [`MemoryStats`].

use softmax_common::{Result, SoftmaxError};
use std::collections::TryReserveError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Page size used for unified-memory migration accounting.
pub const MIGRATION_PAGE_BYTES: usize = 4096;

const ELEM_BYTES: usize = std::mem::size_of::<f64>();
const PAGE_ON_HOST: u8 = 0;
const PAGE_ON_DEVICE: u8 = 1;

static NEXT_ALLOCATION_ID: AtomicU64 = AtomicU64::new(1);

// ── Spaces and access modes ─────────────────────────────────────────────────

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Host-only memory. Device access faults.
    Host,
    /// Device-only memory. Host access must go through `memcpy`.
    Device,
    /// Shared memory visible on both sides after synchronization.
    Shared,
    /// Shared memory whose pages migrate on first touch.
    Unified,
}

impl MemorySpace {
    /// Whether kernels may dereference this space.
    pub fn device_accessible(self) -> bool {
        !matches!(self, Self::Host)
    }

    /// Whether the host may read or write this space directly.
    pub fn host_accessible(self) -> bool {
        !matches!(self, Self::Device)
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Device => write!(f, "device"),
            Self::Shared => write!(f, "shared"),
            Self::Unified => write!(f, "unified"),
        }
    }
}

/// Access declared by a kernel for one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Who is responsible for returning an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    /// Caller must call `ExecutionContext::free`.
    Explicit,
    /// Runtime frees it when the last handle drops.
    Runtime,
}

// ── Faults ──────────────────────────────────────────────────────────────────

/// Fault raised by a single task instance.
///
/// The queue turns the first fault of a batch into
/// [`SoftmaxError::ExecutionFault`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct KernelFault {
    pub reason: String,
}

impl KernelFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn out_of_bounds(label: &str, index: usize, len: usize) -> Self {
        Self::new(format!("index {index} out of bounds for '{label}' of length {len}"))
    }
}

/// Result type returned by kernel bodies.
pub type KernelResult<T> = std::result::Result<T, KernelFault>;

// ── Accounting ──────────────────────────────────────────────────────────────

/// Snapshot of a context's memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Allocations not yet freed or dropped.
    pub live_allocations: usize,
    /// Bytes held by live allocations.
    pub live_bytes: u64,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: u64,
    /// Allocations created since the context was built.
    pub total_allocations: u64,
    /// `memcpy` operations issued by callers.
    pub explicit_transfers: u64,
    /// Copies the runtime performed at access boundaries.
    pub implicit_transfers: u64,
    /// Bytes moved by both kinds of transfer.
    pub bytes_transferred: u64,
    /// Unified-memory pages that changed sides.
    pub page_migrations: u64,
    /// Explicit allocations dropped without `free`.
    pub leaked_allocations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryTracker {
    limit_bytes: u64,
    live_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    live_allocations: AtomicUsize,
    total_allocations: AtomicU64,
    explicit_transfers: AtomicU64,
    implicit_transfers: AtomicU64,
    bytes_transferred: AtomicU64,
    page_migrations: AtomicU64,
    leaked_allocations: AtomicU64,
}

impl MemoryTracker {
    pub(crate) fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes, ..Self::default() }
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let mut current = self.live_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(bytes).ok_or_else(|| SoftmaxError::AllocationFailure {
                requested_bytes: bytes as usize,
                reason: "byte count overflow".into(),
            })?;
            if self.limit_bytes > 0 && next > self.limit_bytes {
                return Err(SoftmaxError::AllocationFailure {
                    requested_bytes: bytes as usize,
                    reason: format!(
                        "memory limit of {} bytes exceeded ({current} bytes live)",
                        self.limit_bytes
                    ),
                });
            }
            match self.live_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak_bytes.fetch_max(next, Ordering::Relaxed);
                    self.live_allocations.fetch_add(1, Ordering::Relaxed);
                    self.total_allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: u64) {
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer(&self, bytes: usize, explicit: bool) {
        if explicit {
            self.explicit_transfers.fetch_add(1, Ordering::Relaxed);
        } else {
            self.implicit_transfers.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_migration(&self) {
        self.page_migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            explicit_transfers: self.explicit_transfers.load(Ordering::Relaxed),
            implicit_transfers: self.implicit_transfers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            page_migrations: self.page_migrations.load(Ordering::Relaxed),
            leaked_allocations: self.leaked_allocations.load(Ordering::Relaxed),
        }
    }
}

// ── Page migration ──────────────────────────────────────────────────────────

/// `len` cells built by `make`, or the reservation error instead of an
/// abort when the request cannot be satisfied.
fn try_filled<T>(len: usize, make: impl Fn() -> T) -> std::result::Result<Box<[T]>, TryReserveError> {
    let mut cells = Vec::new();
    cells.try_reserve_exact(len)?;
    cells.extend((0..len).map(|_| make()));
    Ok(cells.into_boxed_slice())
}

/// Which side currently holds each page of a unified allocation.
#[derive(Debug)]
struct PageTable {
    page_elems: usize,
    owners: Box<[AtomicU8]>,
}

impl PageTable {
    fn try_new(len: usize) -> std::result::Result<Self, TryReserveError> {
        let page_elems = MIGRATION_PAGE_BYTES / ELEM_BYTES;
        let pages = len.div_ceil(page_elems);
        let owners = try_filled(pages, || AtomicU8::new(PAGE_ON_HOST))?;
        Ok(Self { page_elems, owners })
    }

    fn touch(&self, index: usize, side: u8, tracker: &MemoryTracker) {
        if let Some(owner) = self.owners.get(index / self.page_elems)
            && owner.load(Ordering::Relaxed) != side
            && owner.swap(side, Ordering::Relaxed) != side
        {
            tracker.record_migration();
        }
    }

    fn touch_all(&self, side: u8, tracker: &MemoryTracker) {
        for page in 0..self.owners.len() {
            self.touch(page * self.page_elems, side, tracker);
        }
    }

    fn pages_on_device(&self) -> usize {
        self.owners.iter().filter(|o| o.load(Ordering::Relaxed) == PAGE_ON_DEVICE).count()
    }
}

// ── Allocations ─────────────────────────────────────────────────────────────

struct AllocationInner {
    id: u64,
    label: String,
    space: MemorySpace,
    ownership: Ownership,
    cells: Box<[AtomicU64]>,
    pages: Option<PageTable>,
    freed: AtomicBool,
    tracker: Arc<MemoryTracker>,
}

impl AllocationInner {
    fn byte_len(&self) -> u64 {
        (self.cells.len() * ELEM_BYTES) as u64
    }
}

impl Drop for AllocationInner {
    fn drop(&mut self) {
        if self.freed.load(Ordering::Acquire) {
            return;
        }
        self.tracker.release(self.byte_len());
        if self.ownership == Ownership::Explicit {
            self.tracker.leaked_allocations.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = self.id,
                label = %self.label,
                space = %self.space,
                bytes = self.byte_len(),
                "allocation dropped without free; counted as leaked"
            );
        }
    }
}

/// Handle to an allocation owned by an [`ExecutionContext`](crate::ExecutionContext).
///
/// Cloning the handle shares the same storage.
#[derive(Clone)]
pub struct DeviceAllocation {
    inner: Arc<AllocationInner>,
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("space", &self.inner.space)
            .field("len", &self.inner.cells.len())
            .field("freed", &self.is_freed())
            .finish()
    }
}

impl DeviceAllocation {
    pub(crate) fn allocate(
        tracker: &Arc<MemoryTracker>,
        space: MemorySpace,
        ownership: Ownership,
        len: usize,
        label: &str,
        init: f64,
    ) -> Result<Self> {
        let bytes = len.checked_mul(ELEM_BYTES).ok_or_else(|| SoftmaxError::AllocationFailure {
            requested_bytes: usize::MAX,
            reason: format!("{len} elements overflow the address space"),
        })?;
        let out_of_memory = |err: TryReserveError| SoftmaxError::AllocationFailure {
            requested_bytes: bytes,
            reason: format!("'{label}' could not be reserved: {err}"),
        };
        let pages = match space {
            MemorySpace::Unified => Some(PageTable::try_new(len).map_err(out_of_memory)?),
            _ => None,
        };
        let cells = try_filled(len, || AtomicU64::new(init.to_bits())).map_err(out_of_memory)?;
        tracker.reserve(bytes as u64)?;

        let id = NEXT_ALLOCATION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, label, %space, bytes, "allocated");

        Ok(Self {
            inner: Arc::new(AllocationInner {
                id,
                label: label.to_string(),
                space,
                ownership,
                cells,
                pages,
                freed: AtomicBool::new(false),
                tracker: Arc::clone(tracker),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn space(&self) -> MemorySpace {
        self.inner.space
    }

    pub fn len(&self) -> usize {
        self.inner.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cells.is_empty()
    }

    pub fn byte_len(&self) -> u64 {
        self.inner.byte_len()
    }

    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Whether the caller must return this allocation with `free`.
    pub fn requires_free(&self) -> bool {
        self.inner.ownership == Ownership::Explicit
    }

    /// Pages of a unified allocation currently resident on the device.
    pub fn pages_on_device(&self) -> usize {
        self.inner.pages.as_ref().map_or(0, PageTable::pages_on_device)
    }

    /// Kernel-side view with the declared access mode.
    pub fn view(&self, mode: AccessMode) -> GlobalView {
        GlobalView { alloc: self.clone(), mode }
    }

    /// Read the whole allocation from the host.
    ///
    /// # Errors
    ///
    /// Rejects device-only and freed allocations.
    pub fn host_read(&self) -> Result<Vec<f64>> {
        self.check_host_access()?;
        if let Some(pages) = &self.inner.pages {
            pages.touch_all(PAGE_ON_HOST, &self.inner.tracker);
        }
        Ok(self.load_all())
    }

    /// Overwrite the whole allocation from the host.
    ///
    /// # Errors
    ///
    /// Rejects device-only and freed allocations and length mismatches.
    pub fn host_write(&self, data: &[f64]) -> Result<()> {
        self.check_host_access()?;
        if data.len() != self.len() {
            return Err(SoftmaxError::invalid(format!(
                "host write of {} elements into '{}' of length {}",
                data.len(),
                self.label(),
                self.len()
            )));
        }
        if let Some(pages) = &self.inner.pages {
            pages.touch_all(PAGE_ON_HOST, &self.inner.tracker);
        }
        self.store_all(data);
        Ok(())
    }

    fn check_host_access(&self) -> Result<()> {
        if self.is_freed() {
            return Err(SoftmaxError::invalid(format!(
                "use of freed allocation '{}'",
                self.label()
            )));
        }
        if !self.space().host_accessible() {
            return Err(SoftmaxError::invalid(format!(
                "device-only allocation '{}' is not host accessible; copy it with memcpy",
                self.label()
            )));
        }
        Ok(())
    }

    /// Runtime-side read that bypasses the host access rules.
    pub(crate) fn load_all(&self) -> Vec<f64> {
        self.inner.cells.iter().map(|c| f64::from_bits(c.load(Ordering::Relaxed))).collect()
    }

    /// Runtime-side write that bypasses the host access rules.
    pub(crate) fn store_all(&self, data: &[f64]) {
        for (cell, v) in self.inner.cells.iter().zip(data) {
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    pub(crate) fn copy_from(&self, src: &DeviceAllocation) -> KernelResult<()> {
        for alloc in [self, src] {
            if alloc.is_freed() {
                return Err(KernelFault::new(format!(
                    "use of freed allocation '{}'",
                    alloc.label()
                )));
            }
        }
        if self.len() != src.len() {
            return Err(KernelFault::new(format!(
                "copy from '{}' ({}) into '{}' ({}) has mismatched lengths",
                src.label(),
                src.len(),
                self.label(),
                self.len()
            )));
        }
        for (dst, s) in self.inner.cells.iter().zip(src.inner.cells.iter()) {
            dst.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(())
    }

    pub(crate) fn fill(&self, value: f64) -> KernelResult<()> {
        if self.is_freed() {
            return Err(KernelFault::new(format!("use of freed allocation '{}'", self.label())));
        }
        for cell in self.inner.cells.iter() {
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Mark as freed and return its bytes to the tracker.
    pub(crate) fn mark_freed(&self) -> Result<()> {
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(SoftmaxError::invalid(format!(
                "double free of allocation '{}'",
                self.label()
            )));
        }
        self.inner.tracker.release(self.byte_len());
        debug!(id = self.id(), label = self.label(), "freed");
        Ok(())
    }

    pub(crate) fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.inner.tracker
    }
}

// ── Kernel views ────────────────────────────────────────────────────────────

/// Kernel-side view of an allocation with a declared access mode.
#[derive(Debug, Clone)]
pub struct GlobalView {
    alloc: DeviceAllocation,
    mode: AccessMode,
}

impl GlobalView {
    pub fn len(&self) -> usize {
        self.alloc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.is_empty()
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn label(&self) -> &str {
        self.alloc.label()
    }

    fn cell(&self, index: usize, write: bool) -> KernelResult<&AtomicU64> {
        let inner = &self.alloc.inner;
        if self.alloc.is_freed() {
            return Err(KernelFault::new(format!("use of freed allocation '{}'", inner.label)));
        }
        if !inner.space.device_accessible() {
            return Err(KernelFault::new(format!(
                "host-only allocation '{}' dereferenced on device",
                inner.label
            )));
        }
        if write && !self.mode.can_write() {
            return Err(KernelFault::new(format!("write through read-only view of '{}'", inner.label)));
        }
        if !write && !self.mode.can_read() {
            return Err(KernelFault::new(format!("read through write-only view of '{}'", inner.label)));
        }
        let cell = inner
            .cells
            .get(index)
            .ok_or_else(|| KernelFault::out_of_bounds(&inner.label, index, inner.cells.len()))?;
        if let Some(pages) = &inner.pages {
            pages.touch(index, PAGE_ON_DEVICE, &inner.tracker);
        }
        Ok(cell)
    }

    pub fn read(&self, index: usize) -> KernelResult<f64> {
        Ok(f64::from_bits(self.cell(index, false)?.load(Ordering::Relaxed)))
    }

    pub fn write(&self, index: usize, value: f64) -> KernelResult<()> {
        self.cell(index, true)?.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Relaxed atomic `+=`; returns the previous value. Needs `ReadWrite`.
    pub fn fetch_add(&self, index: usize, value: f64) -> KernelResult<f64> {
        if self.mode != AccessMode::ReadWrite {
            return Err(KernelFault::new(format!(
                "atomic update of '{}' needs a read-write view",
                self.label()
            )));
        }
        let cell = self.cell(index, true)?;
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(prev) => return Ok(f64::from_bits(prev)),
                Err(actual) => current = actual,
            }
        }
    }
}
