//! Fixed-capacity descriptor heaps.
//!
//! CPU-visible heaps hold one slot per live view, sampler or query. Indices are
//! handed out from a free queue first and from a high-water mark second; a heap
//! never grows. Per-frame shader-visible tables live in [`table`].

mod table;

pub use table::{DescriptorTable, ShaderVisibleHeap};

use std::collections::VecDeque;

use crate::backend::Backend;
use crate::config::HeapSizes;
use crate::error::{GpuError, GpuResult};

/// Which heap a descriptor lives in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HeapKind {
    ShaderResource,
    Sampler,
    RenderTarget,
    DepthStencil,
    Query,
}

/// A slot in a [`DescriptorHeap`].
///
/// The generation is bumped every time the slot is freed, so a handle kept
/// past its `free_handle` no longer resolves.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DescriptorHandle {
    kind: HeapKind,
    index: u32,
    generation: u32,
}

impl DescriptorHandle {
    #[inline]
    pub fn kind(self) -> HeapKind {
        self.kind
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<D> {
    generation: u32,
    value: Option<D>,
}

#[derive(Debug)]
pub struct DescriptorHeap<D> {
    kind: HeapKind,
    capacity: u32,
    slots: Vec<Slot<D>>,
    free: VecDeque<u32>,
    live: u32,
}

impl<D> DescriptorHeap<D> {
    pub fn new(kind: HeapKind, capacity: u32) -> Self {
        Self {
            kind,
            capacity,
            slots: Vec::new(),
            free: VecDeque::new(),
            live: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Slots ever touched. Never decreases.
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slots currently claimed.
    #[inline]
    pub fn live(&self) -> u32 {
        self.live
    }

    /// Claims a slot.
    ///
    /// Running past the capacity is a configuration error; heaps are sized up
    /// front and never grow.
    pub fn alloc_handle(&mut self) -> GpuResult<DescriptorHandle> {
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                if self.high_water() >= self.capacity {
                    log::error!("{:?} heap exhausted at {} slots", self.kind, self.capacity);
                    return Err(GpuError::HeapExhausted {
                        kind: self.kind,
                        capacity: self.capacity,
                    });
                }
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.high_water() - 1
            }
        };
        self.live += 1;
        Ok(DescriptorHandle {
            kind: self.kind,
            index,
            generation: self.slots[index as usize].generation,
        })
    }

    /// Returns a slot to the free queue. Stale handles are ignored.
    pub fn free_handle(&mut self, handle: DescriptorHandle) -> bool {
        let Some(slot) = self.slot_mut(handle) else {
            debug_assert!(false, "freeing a stale {:?} descriptor", handle.kind);
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.value = None;
        self.free.push_back(handle.index);
        self.live -= 1;
        true
    }

    /// Stores the descriptor a handle points to.
    pub fn write(&mut self, handle: DescriptorHandle, value: D) -> GpuResult<()> {
        let slot = self
            .slot_mut(handle)
            .ok_or(GpuError::StaleHandle("descriptor"))?;
        slot.value = Some(value);
        Ok(())
    }

    pub fn get(&self, handle: DescriptorHandle) -> Option<&D> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| handle.kind == self.kind && slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn is_live(&self, handle: DescriptorHandle) -> bool {
        handle.kind == self.kind
            && self
                .slots
                .get(handle.index as usize)
                .is_some_and(|slot| slot.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: DescriptorHandle) -> Option<&mut Slot<D>> {
        if handle.kind != self.kind {
            return None;
        }
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }
}

/// Every CPU-visible heap a device owns.
#[derive(Debug)]
pub struct DescriptorHeaps<B: Backend> {
    pub shader_resource: DescriptorHeap<B::TextureView>,
    pub sampler: DescriptorHeap<B::Sampler>,
    pub render_target: DescriptorHeap<B::TextureView>,
    pub depth_stencil: DescriptorHeap<B::TextureView>,
    pub query: DescriptorHeap<()>,
}

impl<B: Backend> DescriptorHeaps<B> {
    pub fn new(sizes: &HeapSizes) -> Self {
        Self {
            shader_resource: DescriptorHeap::new(HeapKind::ShaderResource, sizes.shader_resource),
            sampler: DescriptorHeap::new(HeapKind::Sampler, sizes.sampler),
            render_target: DescriptorHeap::new(HeapKind::RenderTarget, sizes.render_target),
            depth_stencil: DescriptorHeap::new(HeapKind::DepthStencil, sizes.depth_stencil),
            query: DescriptorHeap::new(HeapKind::Query, sizes.query),
        }
    }

    /// The view heap for `kind`. Samplers and queries are not views.
    pub fn views_mut(&mut self, kind: HeapKind) -> Option<&mut DescriptorHeap<B::TextureView>> {
        match kind {
            HeapKind::ShaderResource => Some(&mut self.shader_resource),
            HeapKind::RenderTarget => Some(&mut self.render_target),
            HeapKind::DepthStencil => Some(&mut self.depth_stencil),
            HeapKind::Sampler | HeapKind::Query => None,
        }
    }

    /// Frees a handle in whichever heap it belongs to.
    pub fn free(&mut self, handle: DescriptorHandle) -> bool {
        match handle.kind {
            HeapKind::ShaderResource => self.shader_resource.free_handle(handle),
            HeapKind::Sampler => self.sampler.free_handle(handle),
            HeapKind::RenderTarget => self.render_target.free_handle(handle),
            HeapKind::DepthStencil => self.depth_stencil.free_handle(handle),
            HeapKind::Query => self.query.free_handle(handle),
        }
    }
}
