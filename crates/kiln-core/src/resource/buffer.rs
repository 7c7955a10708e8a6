use bitflags::bitflags;

use crate::backend::Backend;
use crate::buffer_pool::BufferAllocation;
use crate::frame::FrameCounter;

use super::{queue_transition, BarrierBatch, ResourceRef, ResourceState};

bitflags! {
    /// How a buffer may be used. Backends size and place the allocation from this.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX    = 1 << 0;
        const INDEX     = 1 << 1;
        const UNIFORM   = 1 << 2;
        const STORAGE   = 1 << 3;
        const COPY_SRC  = 1 << 4;
        const COPY_DST  = 1 << 5;
        const MAP_READ  = 1 << 6;
        const MAP_WRITE = 1 << 7;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Dynamic buffers are renamed on every discarding write instead of being
    /// mutated while the GPU may still read them.
    pub dynamic: bool,
}

impl BufferDesc {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            dynamic: false,
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A buffer as owned by the device.
///
/// The logical buffer outlives its backing allocations: a discarding write
/// swaps in a fresh allocation and leaves the handle callers hold untouched.
#[derive(Debug)]
pub struct Buffer<B: Backend> {
    allocation: BufferAllocation<B>,
    desc: BufferDesc,
    last_used: FrameCounter,
}

impl<B: Backend> Buffer<B> {
    pub(crate) fn new(allocation: BufferAllocation<B>, desc: BufferDesc, frame: FrameCounter) -> Self {
        Self {
            allocation,
            desc,
            last_used: frame,
        }
    }

    #[inline]
    pub fn native(&self) -> &B::Buffer {
        self.allocation.native()
    }

    #[inline]
    pub fn allocation(&self) -> &BufferAllocation<B> {
        &self.allocation
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    /// Logical size in bytes (may be smaller than the backing capacity).
    #[inline]
    pub fn size(&self) -> u64 {
        self.allocation.size()
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.allocation.state
    }

    #[inline]
    pub fn last_used(&self) -> FrameCounter {
        self.last_used
    }

    #[inline]
    pub(crate) fn mark_used(&mut self, frame: FrameCounter) {
        self.last_used = frame;
    }

    /// Queues a transition of the backing allocation. No-op if already in `new_state`.
    pub fn transition_batched(&mut self, batch: &mut BarrierBatch<B>, new_state: ResourceState) -> bool {
        let native = &self.allocation.native;
        queue_transition(
            batch,
            || ResourceRef::Buffer(native.clone()),
            &mut self.allocation.state,
            new_state,
        )
    }

    /// The backing allocation, for the rename pool to swap out.
    pub(crate) fn allocation_mut(&mut self) -> &mut BufferAllocation<B> {
        &mut self.allocation
    }

    pub(crate) fn into_allocation(self) -> BufferAllocation<B> {
        self.allocation
    }
}
