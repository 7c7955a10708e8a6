use crate::backend::Backend;
use crate::buffer_pool::BufferAllocation;
use crate::descriptor::{HeapKind, ShaderVisibleHeap};
use crate::error::{GpuError, GpuResult};
use crate::frame::FenceValue;

/// Alignment of transient uniform allocations.
pub const UNIFORM_ALIGNMENT: u64 = 256;

/// Where a frame slot is in its lifecycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SlotStage {
    /// Never used.
    Idle,
    Recording,
    /// Submitted; the GPU may still be executing it.
    Submitted,
    /// The slot's fence has completed.
    Complete,
}

/// Per-frame linear allocator for uniform data.
#[derive(Debug)]
pub(crate) struct UniformRing<B: Backend> {
    allocation: BufferAllocation<B>,
    cursor: u64,
}

impl<B: Backend> UniformRing<B> {
    pub fn new(allocation: BufferAllocation<B>) -> Self {
        Self { allocation, cursor: 0 }
    }

    #[inline]
    pub fn native(&self) -> &B::Buffer {
        self.allocation.native()
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Reserves `size` bytes and returns their offset.
    pub fn alloc(&mut self, size: u64) -> GpuResult<u64> {
        let offset = self.cursor.next_multiple_of(UNIFORM_ALIGNMENT);
        let capacity = self.allocation.capacity();
        if offset.checked_add(size).is_none_or(|end| end > capacity) {
            return Err(GpuError::RingExhausted {
                requested: size,
                capacity,
            });
        }
        self.cursor = offset + size;
        Ok(offset)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn into_allocation(self) -> BufferAllocation<B> {
        self.allocation
    }
}

/// Resources owned by one frame in flight.
///
/// Nothing here is touched by the CPU until `fence` has completed.
#[derive(Debug)]
pub(crate) struct FrameSlot<B: Backend> {
    pub fence: FenceValue,
    pub stage: SlotStage,
    pub textures: ShaderVisibleHeap<B::TextureView>,
    pub samplers: ShaderVisibleHeap<B::Sampler>,
    pub uniforms: UniformRing<B>,
}

impl<B: Backend> FrameSlot<B> {
    pub fn new(texture_slots: u32, sampler_slots: u32, uniforms: UniformRing<B>) -> Self {
        Self {
            fence: FenceValue::ZERO,
            stage: SlotStage::Idle,
            textures: ShaderVisibleHeap::new(HeapKind::ShaderResource, texture_slots),
            samplers: ShaderVisibleHeap::new(HeapKind::Sampler, sampler_slots),
            uniforms,
        }
    }

    /// Rewinds every per-frame allocator. The fence must have completed.
    pub fn reset(&mut self) {
        self.textures.reset();
        self.samplers.reset();
        self.uniforms.reset();
    }
}
