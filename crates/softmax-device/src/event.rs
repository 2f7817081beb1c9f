//! Completion events for submitted work.

use softmax_common::{Result, SoftmaxError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Queued, waiting on dependencies.
    Submitted,
    /// Executing on the device's compute units.
    Running,
    /// Finished without a fault.
    Complete,
    /// At least one task instance faulted, or a dependency did.
    Faulted,
}

impl EventStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Complete | Self::Faulted)
    }
}

#[derive(Debug)]
struct EventState {
    status: EventStatus,
    fault: Option<String>,
    /// Set once the fault has been returned to a caller.
    observed: bool,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

#[derive(Debug)]
struct EventInner {
    id: u64,
    kernel: String,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Handle to one submission; waiting on it is the only way to observe
/// its effects.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(id: u64, kernel: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id,
                kernel: kernel.into(),
                state: Mutex::new(EventState {
                    status: EventStatus::Submitted,
                    fault: None,
                    observed: false,
                    started_at: None,
                    finished_at: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kernel_name(&self) -> &str {
        &self.inner.kernel
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().expect("event lock poisoned").status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Time between the start of execution and completion.
    pub fn execution_time(&self) -> Option<Duration> {
        let state = self.inner.state.lock().expect("event lock poisoned");
        match (state.started_at, state.finished_at) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Block until the submission finishes.
    ///
    /// # Errors
    ///
    /// [`SoftmaxError::ExecutionFault`] if the submission or one of its
    /// dependencies faulted. The fault counts as observed afterwards.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.block_until_finished();
        if state.status != EventStatus::Faulted {
            return Ok(());
        }
        state.observed = true;
        Err(self.fault_error(&state))
    }

    /// Block until finished and return the fault if no caller has seen it.
    pub(crate) fn take_unobserved_fault(&self) -> Option<SoftmaxError> {
        let mut state = self.block_until_finished();
        if state.status != EventStatus::Faulted || state.observed {
            return None;
        }
        state.observed = true;
        Some(self.fault_error(&state))
    }

    /// Mark the fault as reported through another event.
    pub(crate) fn mark_observed(&self) {
        self.inner.state.lock().expect("event lock poisoned").observed = true;
    }

    /// Whether the queue still has to track this event: it is unfinished, or
    /// it faulted and nobody has seen the fault yet.
    pub(crate) fn needs_tracking(&self) -> bool {
        let state = self.inner.state.lock().expect("event lock poisoned");
        match state.status {
            EventStatus::Complete => false,
            EventStatus::Faulted => !state.observed,
            EventStatus::Submitted | EventStatus::Running => true,
        }
    }

    fn fault_error(&self, state: &EventState) -> SoftmaxError {
        SoftmaxError::fault(
            self.inner.kernel.clone(),
            state.fault.clone().unwrap_or_else(|| "unknown fault".into()),
        )
    }

    /// Block until finished and report the final status without raising.
    pub(crate) fn wait_finished(&self) -> EventStatus {
        self.block_until_finished().status
    }

    fn block_until_finished(&self) -> std::sync::MutexGuard<'_, EventState> {
        let mut state = self.inner.state.lock().expect("event lock poisoned");
        while !state.status.is_finished() {
            state = self.inner.done.wait(state).expect("event lock poisoned");
        }
        state
    }

    pub(crate) fn set_running(&self) {
        let mut state = self.inner.state.lock().expect("event lock poisoned");
        state.status = EventStatus::Running;
        state.started_at = Some(Instant::now());
    }

    pub(crate) fn set_complete(&self) {
        self.finish(EventStatus::Complete, None);
    }

    pub(crate) fn set_faulted(&self, reason: impl Into<String>) {
        self.finish(EventStatus::Faulted, Some(reason.into()));
    }

    fn finish(&self, status: EventStatus, fault: Option<String>) {
        let mut state = self.inner.state.lock().expect("event lock poisoned");
        let now = Instant::now();
        state.status = status;
        state.fault = fault;
        state.started_at.get_or_insert(now);
        state.finished_at = Some(now);
        drop(state);
        self.inner.done.notify_all();
    }
}
