//! Execution context: a device binding plus an asynchronous work queue.
//!
//! Every submission gets a dispatcher thread that waits for its
//! dependencies and then runs the job on the device's rayon pool. Doing the
//! dependency wait outside the pool keeps pool workers free for the kernels
//! that the waiter depends on.

use crate::event::{Event, EventStatus};
use crate::memory::{DeviceAllocation, KernelResult, MemorySpace, MemoryStats, MemoryTracker, Ownership};
use crate::probe::{DeviceInfo, probe_devices, select_device};
use crate::work_group::{Item, NdRange, WorkGroup};
use rayon::prelude::*;
use softmax_common::{DeviceTarget, QueueOrdering, Result, SoftmaxConfig, SoftmaxError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce(&rayon::ThreadPool) -> KernelResult<()> + Send + 'static>;

// ── Builder ──────────────────────────────────────────────────────────────────

/// Builder for [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    target: DeviceTarget,
    ordering: QueueOrdering,
    threads: usize,
    memory_limit: u64,
}

impl ContextBuilder {
    pub fn new(target: DeviceTarget) -> Self {
        Self { target, ordering: QueueOrdering::InOrder, threads: 0, memory_limit: 0 }
    }

    /// Target, ordering, thread count and memory limit from configuration.
    pub fn from_config(config: &SoftmaxConfig) -> Self {
        Self {
            target: config.target,
            ordering: config.ordering,
            threads: config.threads,
            memory_limit: config.memory_limit,
        }
    }

    pub fn ordering(mut self, ordering: QueueOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Compute units to start; 0 uses the device's count.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Cap on live bytes across all allocations; 0 disables the cap.
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Probe devices, bind one and start its compute units.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::DeviceUnavailable`] if no device matches the target
    /// or its worker pool cannot be started.
    pub fn build(self) -> Result<ExecutionContext> {
        let device = select_device(self.target, &probe_devices())?;
        let threads = if self.threads == 0 { device.compute_units } else { self.threads };

        let prefix = format!("softmax-{}", device.kind);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()
            .map_err(|e| SoftmaxError::DeviceUnavailable {
                target: self.target,
                reason: format!("failed to start compute units: {e}"),
            })?;

        info!(
            device = %device.name,
            target = %self.target,
            ordering = %self.ordering,
            threads,
            memory_limit = self.memory_limit,
            "execution context ready"
        );

        Ok(ExecutionContext {
            device: DeviceInfo { compute_units: threads, ..device },
            target: self.target,
            ordering: self.ordering,
            pool: Arc::new(pool),
            tracker: Arc::new(MemoryTracker::new(self.memory_limit)),
            queue: Mutex::new(QueueState::default()),
            next_event_id: AtomicU64::new(1),
        })
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueState {
    tail: Option<Event>,
    outstanding: Vec<Event>,
}

/// A device binding and its work queue.
///
/// Dropping the context waits for every outstanding submission.
#[derive(Debug)]
pub struct ExecutionContext {
    device: DeviceInfo,
    target: DeviceTarget,
    ordering: QueueOrdering,
    pool: Arc<rayon::ThreadPool>,
    tracker: Arc<MemoryTracker>,
    queue: Mutex<QueueState>,
    next_event_id: AtomicU64,
}

impl ExecutionContext {
    /// Bind a device for `target` with the given queue ordering.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::DeviceUnavailable`] when no device matches.
    pub fn create(target: DeviceTarget, ordering: QueueOrdering) -> Result<Self> {
        ContextBuilder::new(target).ordering(ordering).build()
    }

    pub fn from_config(config: &SoftmaxConfig) -> Result<Self> {
        ContextBuilder::from_config(config).build()
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn target(&self) -> DeviceTarget {
        self.target
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.tracker.snapshot()
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// Device-only memory, poisoned with NaN until written.
    pub fn malloc_device(&self, len: usize, label: &str) -> Result<DeviceAllocation> {
        self.allocate(MemorySpace::Device, Ownership::Explicit, len, label, f64::NAN)
    }

    /// Host-only memory; kernels that dereference it fault.
    pub fn malloc_host(&self, len: usize, label: &str) -> Result<DeviceAllocation> {
        self.allocate(MemorySpace::Host, Ownership::Explicit, len, label, 0.0)
    }

    /// Shared memory that must be returned with [`free`](Self::free).
    pub fn malloc_shared(&self, len: usize, label: &str) -> Result<DeviceAllocation> {
        self.allocate(MemorySpace::Shared, Ownership::Explicit, len, label, 0.0)
    }

    /// Unified memory with on-demand page migration, freed on drop.
    pub fn malloc_unified(&self, len: usize, label: &str) -> Result<DeviceAllocation> {
        self.allocate(MemorySpace::Unified, Ownership::Runtime, len, label, 0.0)
    }

    /// Device memory owned by a runtime object such as a mirrored buffer.
    pub(crate) fn malloc_runtime_device(&self, len: usize, label: &str) -> Result<DeviceAllocation> {
        self.allocate(MemorySpace::Device, Ownership::Runtime, len, label, f64::NAN)
    }

    fn allocate(
        &self,
        space: MemorySpace,
        ownership: Ownership,
        len: usize,
        label: &str,
        init: f64,
    ) -> Result<DeviceAllocation> {
        DeviceAllocation::allocate(&self.tracker, space, ownership, len, label, init)
    }

    /// Return an allocation to the context.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::InvalidArguments`] on double free or when the
    /// allocation belongs to another context.
    pub fn free(&self, allocation: DeviceAllocation) -> Result<()> {
        if !Arc::ptr_eq(allocation.tracker(), &self.tracker) {
            return Err(SoftmaxError::invalid(format!(
                "allocation '{}' belongs to a different context",
                allocation.label()
            )));
        }
        allocation.mark_freed()
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Start describing a submission named `kernel`.
    pub fn launch(&self, kernel: &str) -> LaunchBuilder<'_> {
        LaunchBuilder { ctx: self, kernel: kernel.to_string(), deps: Vec::new() }
    }

    /// Enqueue a copy of `src` into `dst`.
    pub fn memcpy(&self, dst: &DeviceAllocation, src: &DeviceAllocation) -> Result<Event> {
        self.launch("memcpy").memcpy(dst, src)
    }

    /// Block until `event` finishes.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::ExecutionFault`] if it or a dependency faulted.
    pub fn wait(&self, event: &Event) -> Result<()> {
        event.wait()
    }

    /// Block until every outstanding submission finishes.
    ///
    /// Returns the first fault that no earlier `wait` reported, after all
    /// submissions finished.
    pub fn wait_all(&self) -> Result<()> {
        let pending = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            std::mem::take(&mut queue.outstanding)
        };
        let mut first_fault = None;
        for event in pending {
            if let Some(err) = event.take_unobserved_fault() {
                first_fault.get_or_insert(err);
            }
        }
        first_fault.map_or(Ok(()), Err)
    }

    /// Submissions still tracked by the queue: unfinished ones plus faulted
    /// ones whose fault nobody has waited on.
    pub fn pending_submissions(&self) -> usize {
        let queue = self.queue.lock().expect("queue lock poisoned");
        queue.outstanding.iter().filter(|e| e.needs_tracking()).count()
    }

    fn enqueue(&self, kernel: String, deps: Vec<Event>, job: Job) -> Result<Event> {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = Event::new(id, kernel.clone());

        let predecessor = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            queue.outstanding.retain(Event::needs_tracking);
            queue.outstanding.push(event.clone());
            let previous = queue.tail.replace(event.clone());
            match self.ordering {
                QueueOrdering::InOrder => previous,
                QueueOrdering::Unordered => None,
            }
        };
        debug!(id, kernel = %kernel, deps = deps.len(), "enqueued");

        let pool = Arc::clone(&self.pool);
        let signal = event.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("softmax-queue-{id}"))
            .spawn(move || dispatch(&pool, &signal, predecessor, deps, job));

        if let Err(e) = spawned {
            let reason = format!("failed to start dispatcher: {e}");
            event.set_faulted(reason.clone());
            return Err(SoftmaxError::fault(kernel, reason));
        }
        Ok(event)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Err(err) = self.wait_all() {
            debug!(%err, "fault observed while draining queue on drop");
        }
    }
}

/// Runs on the submission's dispatcher thread.
///
/// The in-order predecessor only orders execution; explicit dependencies
/// also propagate faults.
fn dispatch(
    pool: &rayon::ThreadPool,
    event: &Event,
    predecessor: Option<Event>,
    deps: Vec<Event>,
    job: Job,
) {
    if let Some(previous) = predecessor {
        previous.wait_finished();
    }
    for dep in &deps {
        if dep.wait_finished() == EventStatus::Faulted {
            // Reported from here on through this event.
            dep.mark_observed();
            drop(job);
            event.set_faulted(format!(
                "dependency '{}' (event {}) faulted",
                dep.kernel_name(),
                dep.id()
            ));
            return;
        }
    }
    drop(deps);

    event.set_running();
    // The job (and every allocation handle it captured) is dropped before
    // the event is signalled.
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || job(pool)));
    match outcome {
        Ok(Ok(())) => event.set_complete(),
        Ok(Err(fault)) => {
            warn!(kernel = event.kernel_name(), %fault, "kernel faulted");
            event.set_faulted(fault.reason);
        }
        Err(_) => {
            warn!(kernel = event.kernel_name(), "kernel panicked");
            event.set_faulted("task instance panicked");
        }
    }
}

// ── Launches ─────────────────────────────────────────────────────────────────

/// Describes one submission: its name, dependencies and body.
#[derive(Debug)]
pub struct LaunchBuilder<'q> {
    ctx: &'q ExecutionContext,
    kernel: String,
    deps: Vec<Event>,
}

impl LaunchBuilder<'_> {
    /// Start only after `event` completed. A fault in `event` faults this
    /// submission without running it.
    pub fn after(mut self, event: &Event) -> Self {
        self.deps.push(event.clone());
        self
    }

    pub fn after_all(mut self, events: &[Event]) -> Self {
        self.deps.extend(events.iter().cloned());
        self
    }

    /// One task instance per index in `0..global`.
    pub fn parallel_for<F>(self, global: usize, body: F) -> Result<Event>
    where
        F: Fn(Item) -> KernelResult<()> + Send + Sync + 'static,
    {
        debug!(kernel = %self.kernel, global, "parallel_for");
        self.submit(move |pool| {
            pool.install(|| {
                (0..global).into_par_iter().try_for_each(|id| body(Item { id, range: global }))
            })
        })
    }

    /// One `body` call per work group of `range`.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::InvalidArguments`] when the group exceeds the
    /// device's work-group limit, [`SoftmaxError::AllocationFailure`] when
    /// its local memory does not fit.
    pub fn parallel_for_work_group<F>(self, range: NdRange, body: F) -> Result<Event>
    where
        F: Fn(&mut WorkGroup) -> KernelResult<()> + Send + Sync + 'static,
    {
        let device = &self.ctx.device;
        if range.group_size() > device.max_work_group_size {
            return Err(SoftmaxError::invalid(format!(
                "work-group size {} exceeds device limit {} on '{}'",
                range.group_size(),
                device.max_work_group_size,
                device.name
            )));
        }
        let local_bytes = range.group_size() * std::mem::size_of::<f64>();
        if local_bytes > device.local_mem_bytes {
            return Err(SoftmaxError::AllocationFailure {
                requested_bytes: local_bytes,
                reason: format!(
                    "work-group local memory exceeds {} bytes on '{}'",
                    device.local_mem_bytes, device.name
                ),
            });
        }

        debug!(
            kernel = %self.kernel,
            len = range.len(),
            group_size = range.group_size(),
            groups = range.num_groups(),
            "parallel_for_work_group"
        );
        self.submit(move |pool| {
            pool.install(|| {
                (0..range.num_groups()).into_par_iter().try_for_each(|group_id| {
                    let mut group = WorkGroup::new(group_id, range);
                    body(&mut group)
                })
            })
        })
    }

    /// A single task instance.
    pub fn single_task<F>(self, body: F) -> Result<Event>
    where
        F: FnOnce() -> KernelResult<()> + Send + 'static,
    {
        self.submit(move |_| body())
    }

    /// Copy `src` into `dst`; both must have the same length.
    pub fn memcpy(self, dst: &DeviceAllocation, src: &DeviceAllocation) -> Result<Event> {
        if dst.len() != src.len() {
            return Err(SoftmaxError::invalid(format!(
                "memcpy from '{}' ({} elements) into '{}' ({} elements)",
                src.label(),
                src.len(),
                dst.label(),
                dst.len()
            )));
        }
        let (dst, src) = (dst.clone(), src.clone());
        let tracker = Arc::clone(&self.ctx.tracker);
        self.submit(move |_| {
            dst.copy_from(&src)?;
            tracker.record_transfer(dst.byte_len() as usize, true);
            Ok(())
        })
    }

    /// Set every element of `dst` to `value`.
    pub fn fill(self, dst: &DeviceAllocation, value: f64) -> Result<Event> {
        let dst = dst.clone();
        self.submit(move |_| dst.fill(value))
    }

    fn submit<J>(self, job: J) -> Result<Event>
    where
        J: FnOnce(&rayon::ThreadPool) -> KernelResult<()> + Send + 'static,
    {
        self.ctx.enqueue(self.kernel, self.deps, Box::new(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AccessMode, KernelFault};

    fn cpu(ordering: QueueOrdering) -> ExecutionContext {
        ContextBuilder::new(DeviceTarget::Cpu).ordering(ordering).threads(2).build().unwrap()
    }

    #[test]
    fn parallel_for_writes_every_index() {
        let ctx = cpu(QueueOrdering::InOrder);
        let out = ctx.malloc_shared(100, "out").unwrap();
        let view = out.view(AccessMode::Write);
        let ev = ctx
            .launch("iota")
            .parallel_for(100, move |item| view.write(item.id, item.id as f64))
            .unwrap();
        ctx.wait(&ev).unwrap();
        let data = out.host_read().unwrap();
        assert_eq!(data[99], 99.0);
        ctx.free(out).unwrap();
    }

    #[test]
    fn fault_surfaces_on_wait() {
        let ctx = cpu(QueueOrdering::InOrder);
        let ev = ctx
            .launch("boom")
            .parallel_for(8, |item| {
                if item.id == 5 { Err(KernelFault::new("bad index")) } else { Ok(()) }
            })
            .unwrap();
        let err = ctx.wait(&ev).unwrap_err();
        assert!(matches!(err, SoftmaxError::ExecutionFault { ref kernel, .. } if kernel == "boom"));
    }

    #[test]
    fn panicking_task_becomes_fault() {
        let ctx = cpu(QueueOrdering::Unordered);
        let ev = ctx.launch("panics").single_task(|| panic!("task died")).unwrap();
        assert!(ctx.wait(&ev).unwrap_err().is_execution_fault());
    }

    #[test]
    fn dependency_fault_propagates() {
        let ctx = cpu(QueueOrdering::Unordered);
        let bad = ctx.launch("first").single_task(|| Err(KernelFault::new("x"))).unwrap();
        let next = ctx.launch("second").after(&bad).single_task(|| Ok(())).unwrap();
        let err = ctx.wait(&next).unwrap_err();
        assert!(err.to_string().contains("dependency 'first'"), "{err}");
    }

    #[test]
    fn in_order_queue_does_not_propagate_faults() {
        let ctx = cpu(QueueOrdering::InOrder);
        let bad = ctx.launch("bad").single_task(|| Err(KernelFault::new("x"))).unwrap();
        let good = ctx.launch("good").single_task(|| Ok(())).unwrap();
        ctx.wait(&good).unwrap();
        assert_eq!(bad.status(), EventStatus::Faulted);
    }

    #[test]
    fn wait_all_reports_first_fault() {
        let ctx = cpu(QueueOrdering::Unordered);
        ctx.launch("ok").single_task(|| Ok(())).unwrap();
        ctx.launch("bad").single_task(|| Err(KernelFault::new("x"))).unwrap();
        assert!(ctx.wait_all().unwrap_err().is_execution_fault());
        ctx.wait_all().unwrap();
    }

    #[test]
    fn waited_faults_are_released_from_the_queue() {
        let ctx = cpu(QueueOrdering::InOrder);
        for _ in 0..100 {
            let bad = ctx.launch("bad").single_task(|| Err(KernelFault::new("x"))).unwrap();
            assert!(ctx.wait(&bad).is_err());
        }
        let good = ctx.launch("good").single_task(|| Ok(())).unwrap();
        ctx.wait(&good).unwrap();
        assert_eq!(ctx.pending_submissions(), 0);
        ctx.wait_all().unwrap();
    }

    #[test]
    fn propagated_dependency_fault_is_reported_once() {
        let ctx = cpu(QueueOrdering::Unordered);
        let bad = ctx.launch("first").single_task(|| Err(KernelFault::new("x"))).unwrap();
        let next = ctx.launch("second").after(&bad).single_task(|| Ok(())).unwrap();
        assert!(ctx.wait(&next).is_err());
        ctx.wait_all().unwrap();
    }

    #[test]
    fn unwaited_fault_keeps_the_event_tracked() {
        let ctx = cpu(QueueOrdering::InOrder);
        let bad = ctx.launch("bad").single_task(|| Err(KernelFault::new("x"))).unwrap();
        assert_eq!(bad.wait_finished(), EventStatus::Faulted);
        assert_eq!(ctx.pending_submissions(), 1);
        assert!(ctx.wait_all().is_err());
        assert_eq!(ctx.pending_submissions(), 0);
    }

    #[test]
    fn memcpy_rejects_length_mismatch() {
        let ctx = cpu(QueueOrdering::InOrder);
        let a = ctx.malloc_shared(4, "a").unwrap();
        let b = ctx.malloc_device(5, "b").unwrap();
        assert!(matches!(ctx.memcpy(&b, &a), Err(SoftmaxError::InvalidArguments { .. })));
        ctx.free(a).unwrap();
        ctx.free(b).unwrap();
    }

    #[test]
    fn memcpy_counts_explicit_transfer() {
        let ctx = cpu(QueueOrdering::InOrder);
        let host = ctx.malloc_host(4, "h").unwrap();
        host.host_write(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let dev = ctx.malloc_device(4, "d").unwrap();
        let ev = ctx.memcpy(&dev, &host).unwrap();
        ctx.wait(&ev).unwrap();
        let stats = ctx.memory_stats();
        assert_eq!(stats.explicit_transfers, 1);
        assert_eq!(stats.bytes_transferred, 32);
        ctx.free(host).unwrap();
        ctx.free(dev).unwrap();
    }

    #[test]
    fn oversized_work_group_is_rejected() {
        let ctx = cpu(QueueOrdering::InOrder);
        let range = NdRange::new(10, ctx.device().max_work_group_size + 1).unwrap();
        let err = ctx.launch("wg").parallel_for_work_group(range, |_| Ok(())).unwrap_err();
        assert!(matches!(err, SoftmaxError::InvalidArguments { .. }));
    }

    #[test]
    fn free_rejects_foreign_allocation() {
        let a = cpu(QueueOrdering::InOrder);
        let b = cpu(QueueOrdering::InOrder);
        let alloc = a.malloc_shared(1, "x").unwrap();
        assert!(b.free(alloc.clone()).is_err());
        a.free(alloc).unwrap();
    }

    #[test]
    fn memory_limit_applies_to_context() {
        let ctx = ContextBuilder::new(DeviceTarget::Cpu).memory_limit(64).build().unwrap();
        let err = ctx.malloc_device(16, "too-big").unwrap_err();
        assert!(matches!(err, SoftmaxError::AllocationFailure { requested_bytes: 128, .. }));
    }
}
