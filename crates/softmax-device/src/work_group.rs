//! Launch geometry and work-group execution.
//!
//! A work group runs its items phase by phase: [`WorkGroup::for_each_item`]
//! runs one phase for every item, and [`WorkGroup::barrier`] ends it. Writes
//! to [`LocalMemory`] land in a pending copy and only become visible to
//! reads after the next barrier, so a reduction that skips a barrier reads
//! stale values instead of silently working.

use crate::memory::{KernelFault, KernelResult};
use softmax_common::{Result, SoftmaxError};

/// Global range of a work-group launch, padded up to whole groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    len: usize,
    group_size: usize,
}

impl NdRange {
    /// # Errors
    ///
    /// [`SoftmaxError::InvalidArguments`] for a zero group size.
    pub fn new(len: usize, group_size: usize) -> Result<Self> {
        if group_size == 0 {
            return Err(SoftmaxError::invalid("work-group size must be > 0"));
        }
        Ok(Self { len, group_size })
    }

    /// Number of valid (unpadded) items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn num_groups(&self) -> usize {
        self.len.div_ceil(self.group_size)
    }

    /// Global range after padding to a multiple of the group size.
    pub fn padded_len(&self) -> usize {
        self.num_groups() * self.group_size
    }

    /// Whether the global range is already a multiple of the group size.
    pub fn is_uniform(&self) -> bool {
        self.len.is_multiple_of(self.group_size)
    }
}

/// Position of one task instance in a flat launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub id: usize,
    pub range: usize,
}

/// Position of one task instance inside a work group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdItem {
    pub global_id: usize,
    pub local_id: usize,
    pub group_id: usize,
    pub group_size: usize,
    /// Unpadded global length.
    pub global_len: usize,
}

impl NdItem {
    /// False for padding items past the end of the data.
    pub fn in_bounds(&self) -> bool {
        self.global_id < self.global_len
    }
}

/// Per-group scratch memory with barrier-scoped visibility.
#[derive(Debug)]
pub struct LocalMemory {
    visible: Vec<f64>,
    pending: Vec<f64>,
}

impl LocalMemory {
    fn new(len: usize) -> Self {
        // Uninitialized slots read as NaN.
        Self { visible: vec![f64::NAN; len], pending: vec![f64::NAN; len] }
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    /// Value as of the last barrier.
    pub fn read(&self, slot: usize) -> KernelResult<f64> {
        self.visible
            .get(slot)
            .copied()
            .ok_or_else(|| KernelFault::out_of_bounds("local memory", slot, self.visible.len()))
    }

    /// Staged write, published by the next barrier.
    pub fn write(&mut self, slot: usize, value: f64) -> KernelResult<()> {
        let len = self.pending.len();
        let cell = self
            .pending
            .get_mut(slot)
            .ok_or_else(|| KernelFault::out_of_bounds("local memory", slot, len))?;
        *cell = value;
        Ok(())
    }

    fn publish(&mut self) {
        self.visible.copy_from_slice(&self.pending);
    }
}

/// One executing work group.
#[derive(Debug)]
pub struct WorkGroup {
    group_id: usize,
    range: NdRange,
    local: LocalMemory,
    barriers: usize,
}

impl WorkGroup {
    /// Local memory holds one `f64` slot per item.
    pub(crate) fn new(group_id: usize, range: NdRange) -> Self {
        Self { group_id, range, local: LocalMemory::new(range.group_size()), barriers: 0 }
    }

    pub fn group_id(&self) -> usize {
        self.group_id
    }

    pub fn group_size(&self) -> usize {
        self.range.group_size()
    }

    pub fn num_groups(&self) -> usize {
        self.range.num_groups()
    }

    pub fn range(&self) -> NdRange {
        self.range
    }

    /// Barriers crossed so far by this group.
    pub fn barriers_crossed(&self) -> usize {
        self.barriers
    }

    pub fn local(&self) -> &LocalMemory {
        &self.local
    }

    /// Run one phase for every item of the group, padding items included.
    ///
    /// Stops at the first fault.
    pub fn for_each_item<F>(&mut self, mut body: F) -> KernelResult<()>
    where
        F: FnMut(NdItem, &mut LocalMemory) -> KernelResult<()>,
    {
        let group_size = self.range.group_size();
        for local_id in 0..group_size {
            let item = NdItem {
                global_id: self.group_id * group_size + local_id,
                local_id,
                group_id: self.group_id,
                group_size,
                global_len: self.range.len(),
            };
            body(item, &mut self.local)?;
        }
        Ok(())
    }

    /// Synchronize the group: publish staged local writes.
    pub fn barrier(&mut self) {
        self.local.publish();
        self.barriers += 1;
    }
}
