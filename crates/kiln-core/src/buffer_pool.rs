//! Rename-on-write for dynamic buffers.
//!
//! A dynamic buffer is never written while the GPU may still read it. A
//! discarding write retires the current allocation and hands back another one:
//!
//! ```text
//!  discard() ──► discarded ──present──► pending ──present──► free ──best fit──► reuse
//! ```
//!
//! Each present rotates the lists exactly once, so a retired allocation sits out
//! one full frame before it can be handed out again. With more than two frames
//! in flight the pending stage is that many frames deep minus one. Reuse picks
//! the smallest free allocation that is large enough; only when none fits is a
//! new one made.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::Backend;
use crate::error::GpuResult;
use crate::resource::{BufferDesc, BufferUsage, ResourceState};

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

/// One native buffer allocation.
#[derive(Debug)]
pub struct BufferAllocation<B: Backend> {
    pub(crate) native: B::Buffer,
    pub(crate) state: ResourceState,
    usage: BufferUsage,
    capacity: u64,
    size: u64,
    id: u64,
}

impl<B: Backend> BufferAllocation<B> {
    pub(crate) fn new(native: B::Buffer, usage: BufferUsage, capacity: u64) -> Self {
        // Upload memory is permanently readable; read-back memory is a copy target.
        let state = if usage.contains(BufferUsage::MAP_WRITE) {
            ResourceState::GenericRead
        } else if usage.contains(BufferUsage::MAP_READ) {
            ResourceState::CopyDest
        } else {
            ResourceState::Initial
        };
        Self {
            native,
            state,
            usage,
            capacity,
            size: capacity,
            id: NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn native(&self) -> &B::Buffer {
        &self.native
    }

    /// Bytes actually allocated.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes the current owner asked for.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Process-unique identity of the native allocation.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn into_native(self) -> B::Buffer {
        self.native
    }
}

/// Dynamic buffer type. Each type recycles only within itself.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BufferClass {
    Vertex,
    Index,
    Uniform,
    Other,
}

impl BufferClass {
    pub fn of(usage: BufferUsage) -> Self {
        if usage.contains(BufferUsage::VERTEX) {
            BufferClass::Vertex
        } else if usage.contains(BufferUsage::INDEX) {
            BufferClass::Index
        } else if usage.contains(BufferUsage::UNIFORM) {
            BufferClass::Uniform
        } else {
            BufferClass::Other
        }
    }
}

/// Discard / pending / free lists for one [`BufferClass`].
#[derive(Debug)]
pub struct BufferPool<B: Backend> {
    class: BufferClass,
    discarded: Vec<BufferAllocation<B>>,
    /// One list per grace frame, oldest first.
    pending: VecDeque<Vec<BufferAllocation<B>>>,
    free: Vec<BufferAllocation<B>>,
    /// Native allocations made by this pool and not yet destroyed.
    allocated: usize,
    peak_pooled: usize,
}

impl<B: Backend> BufferPool<B> {
    pub fn new(class: BufferClass) -> Self {
        Self::with_grace(class, 1)
    }

    /// A pool whose retirees wait `grace_frames` presents in the pending stage.
    pub fn with_grace(class: BufferClass, grace_frames: usize) -> Self {
        Self {
            class,
            discarded: Vec::new(),
            pending: (0..grace_frames.max(1)).map(|_| Vec::new()).collect(),
            free: Vec::new(),
            allocated: 0,
            peak_pooled: 0,
        }
    }

    #[inline]
    pub fn class(&self) -> BufferClass {
        self.class
    }

    /// Returns a free allocation of at least `size` bytes, creating one if needed.
    pub fn acquire(&mut self, backend: &B, desc: &BufferDesc, size: u64) -> GpuResult<BufferAllocation<B>> {
        debug_assert_eq!(BufferClass::of(desc.usage), self.class);
        if let Some(reused) = self.take_best_fit(desc.usage, size) {
            log::trace!(
                "{:?} pool: reused allocation {} (capacity {}) for {} bytes",
                self.class,
                reused.id,
                reused.capacity,
                size
            );
            return Ok(reused);
        }

        let native = backend.create_buffer(&BufferDesc {
            size,
            ..desc.clone()
        })?;
        self.allocated += 1;
        let allocation = BufferAllocation::new(native, desc.usage, size);
        log::debug!(
            "{:?} pool: new allocation {} of {} bytes ({} live)",
            self.class,
            allocation.id,
            size,
            self.allocated
        );
        Ok(allocation)
    }

    /// Swaps `current` for an allocation safe to write `size` bytes into and
    /// retires the old one. On error `current` is left untouched.
    pub fn discard(
        &mut self,
        backend: &B,
        current: &mut BufferAllocation<B>,
        desc: &BufferDesc,
        size: u64,
    ) -> GpuResult<()> {
        let fresh = self.acquire(backend, desc, size)?;
        let old = std::mem::replace(current, fresh);
        self.discarded.push(old);
        self.note_peak();
        Ok(())
    }

    /// Retires an allocation whose owner was destroyed.
    pub fn retire(&mut self, old: BufferAllocation<B>) {
        self.discarded.push(old);
        self.note_peak();
    }

    /// Moves pending → free and discarded → pending. Called once per present.
    pub fn rotate(&mut self) {
        if let Some(mut oldest) = self.pending.pop_front() {
            self.free.append(&mut oldest);
        }
        self.pending.push_back(std::mem::take(&mut self.discarded));
        self.note_peak();
    }

    /// Destroys every pooled allocation. Only valid once the GPU is idle.
    pub fn drain_all(&mut self, backend: &B) {
        let lists = std::iter::once(&mut self.discarded)
            .chain(self.pending.iter_mut())
            .chain(std::iter::once(&mut self.free));
        for list in lists {
            for allocation in list.drain(..) {
                backend.destroy_buffer(allocation.into_native());
                self.allocated -= 1;
            }
        }
    }

    /// Allocations currently held by the pool (all three lists).
    #[inline]
    pub fn pooled_count(&self) -> usize {
        self.discarded.len() + self.pending.iter().map(Vec::len).sum::<usize>() + self.free.len()
    }

    #[inline]
    pub fn peak_pooled(&self) -> usize {
        self.peak_pooled
    }

    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Whether the allocation is retired and not yet safe to reuse.
    pub fn is_in_flight(&self, id: u64) -> bool {
        self.discarded
            .iter()
            .chain(self.pending.iter().flatten())
            .any(|a| a.id == id)
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.iter().flatten().any(|a| a.id == id)
    }

    fn take_best_fit(&mut self, usage: BufferUsage, size: u64) -> Option<BufferAllocation<B>> {
        let index = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, a)| a.capacity >= size && a.usage.contains(usage))
            .min_by_key(|(_, a)| a.capacity)
            .map(|(i, _)| i)?;
        let mut allocation = self.free.swap_remove(index);
        allocation.size = size;
        Some(allocation)
    }

    fn note_peak(&mut self) {
        self.peak_pooled = self.peak_pooled.max(self.pooled_count());
    }
}

/// One [`BufferPool`] per [`BufferClass`].
#[derive(Debug)]
pub struct BufferPools<B: Backend> {
    vertex: BufferPool<B>,
    index: BufferPool<B>,
    uniform: BufferPool<B>,
    other: BufferPool<B>,
}

impl<B: Backend> Default for BufferPools<B> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<B: Backend> BufferPools<B> {
    pub fn new(grace_frames: usize) -> Self {
        Self {
            vertex: BufferPool::with_grace(BufferClass::Vertex, grace_frames),
            index: BufferPool::with_grace(BufferClass::Index, grace_frames),
            uniform: BufferPool::with_grace(BufferClass::Uniform, grace_frames),
            other: BufferPool::with_grace(BufferClass::Other, grace_frames),
        }
    }

    pub fn get(&self, class: BufferClass) -> &BufferPool<B> {
        match class {
            BufferClass::Vertex => &self.vertex,
            BufferClass::Index => &self.index,
            BufferClass::Uniform => &self.uniform,
            BufferClass::Other => &self.other,
        }
    }

    pub fn get_mut(&mut self, class: BufferClass) -> &mut BufferPool<B> {
        match class {
            BufferClass::Vertex => &mut self.vertex,
            BufferClass::Index => &mut self.index,
            BufferClass::Uniform => &mut self.uniform,
            BufferClass::Other => &mut self.other,
        }
    }

    pub fn rotate(&mut self) {
        self.vertex.rotate();
        self.index.rotate();
        self.uniform.rotate();
        self.other.rotate();
    }

    pub fn drain_all(&mut self, backend: &B) {
        self.vertex.drain_all(backend);
        self.index.drain_all(backend);
        self.uniform.drain_all(backend);
        self.other.drain_all(backend);
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        [&self.vertex, &self.index, &self.uniform, &self.other]
            .iter()
            .any(|p| p.is_in_flight(id))
    }

    pub fn peak_pooled(&self) -> usize {
        self.vertex.peak_pooled() + self.index.peak_pooled() + self.uniform.peak_pooled() + self.other.peak_pooled()
    }

    pub fn pooled_count(&self) -> usize {
        self.vertex.pooled_count()
            + self.index.pooled_count()
            + self.uniform.pooled_count()
            + self.other.pooled_count()
    }

    pub fn allocated_count(&self) -> usize {
        self.vertex.allocated_count()
            + self.index.allocated_count()
            + self.uniform.allocated_count()
            + self.other.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{CompletionMode, HeadlessBackend};

    fn vertex_desc() -> BufferDesc {
        BufferDesc::new(0, BufferUsage::VERTEX | BufferUsage::MAP_WRITE).dynamic()
    }

    fn seed_free(pool: &mut BufferPool<HeadlessBackend>, backend: &HeadlessBackend, sizes: &[u64]) {
        for &size in sizes {
            let a = pool.acquire(backend, &vertex_desc(), size).unwrap();
            pool.retire(a);
        }
        pool.rotate();
        pool.rotate();
        assert_eq!(pool.free_count(), sizes.len());
    }

    // ── best fit ──────────────────────────────────────────────────────────

    #[test]
    fn picks_smallest_sufficient_buffer() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::new(BufferClass::Vertex);
        seed_free(&mut pool, &backend, &[64, 256, 1024]);

        let mut current = pool.acquire(&backend, &vertex_desc(), 32).unwrap();
        assert_eq!(current.capacity(), 64);

        pool.discard(&backend, &mut current, &vertex_desc(), 200).unwrap();
        assert_eq!(current.capacity(), 256);
        assert_eq!(current.size(), 200);
        assert_eq!(pool.allocated_count(), 3);
    }

    #[test]
    fn allocates_when_nothing_fits() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::new(BufferClass::Vertex);
        seed_free(&mut pool, &backend, &[64, 128]);

        let big = pool.acquire(&backend, &vertex_desc(), 4096).unwrap();
        assert_eq!(big.capacity(), 4096);
        assert_eq!(pool.allocated_count(), 3);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn does_not_mix_incompatible_usage() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::new(BufferClass::Vertex);
        seed_free(&mut pool, &backend, &[256]);

        let desc = BufferDesc::new(0, BufferUsage::VERTEX | BufferUsage::STORAGE).dynamic();
        let a = pool.acquire(&backend, &desc, 128).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(a.capacity(), 128);
    }

    // ── rotation ──────────────────────────────────────────────────────────

    #[test]
    fn discarded_buffer_sits_out_one_frame() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::new(BufferClass::Vertex);

        let mut current = pool.acquire(&backend, &vertex_desc(), 1024).unwrap();
        let first_id = current.id();

        // Frame F: discard.
        pool.discard(&backend, &mut current, &vertex_desc(), 1024).unwrap();
        assert_ne!(current.id(), first_id);
        assert!(pool.is_in_flight(first_id));
        pool.rotate();

        // Frame F+1: still in flight, must not come back.
        assert!(pool.is_pending(first_id));
        pool.discard(&backend, &mut current, &vertex_desc(), 1024).unwrap();
        assert_ne!(current.id(), first_id);
        pool.rotate();

        // Frame F+2: eligible again.
        assert!(!pool.is_in_flight(first_id));
        pool.discard(&backend, &mut current, &vertex_desc(), 1024).unwrap();
        assert_eq!(current.id(), first_id);
        assert_eq!(pool.allocated_count(), 3);
    }

    #[test]
    fn drain_destroys_everything_pooled() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::new(BufferClass::Uniform);
        let desc = BufferDesc::new(0, BufferUsage::UNIFORM).dynamic();
        let mut current = pool.acquire(&backend, &desc, 256).unwrap();
        pool.discard(&backend, &mut current, &desc, 256).unwrap();
        pool.rotate();
        pool.retire(current);

        pool.drain_all(&backend);
        assert_eq!(pool.pooled_count(), 0);
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(backend.stats().buffers_destroyed, 2);
    }

    #[test]
    fn deeper_grace_for_three_frames_in_flight() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        let mut pool = BufferPool::with_grace(BufferClass::Vertex, 2);
        let first = pool.acquire(&backend, &vertex_desc(), 256).unwrap();
        let first_id = first.id();
        pool.retire(first);

        pool.rotate();
        pool.rotate();
        assert!(pool.is_pending(first_id));
        pool.rotate();
        assert!(!pool.is_in_flight(first_id));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn class_follows_usage() {
        assert_eq!(BufferClass::of(BufferUsage::VERTEX | BufferUsage::COPY_DST), BufferClass::Vertex);
        assert_eq!(BufferClass::of(BufferUsage::INDEX), BufferClass::Index);
        assert_eq!(BufferClass::of(BufferUsage::UNIFORM), BufferClass::Uniform);
        assert_eq!(BufferClass::of(BufferUsage::MAP_READ), BufferClass::Other);
    }
}
