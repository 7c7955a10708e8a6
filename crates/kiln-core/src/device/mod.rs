//! Frame ring and device orchestrator.
//!
//! [`Device`] owns `N` frame slots and drives the per-frame state machine:
//!
//! ```text
//!  begin_frame ─► set_* / draw ─► present ─► (GPU) ─► fence complete
//!       ▲                                                  │
//!       └──────────── slot reused N frames later ◄─────────┘
//! ```
//!
//! State setters only mark dirty bits. Everything that touches the command
//! list (barrier flushes, pipeline lookups, descriptor table copies) happens
//! in `apply_state` right before a draw.

mod resources;
mod slot;
mod state;
mod transfer;

#[cfg(test)]
mod tests;

pub use resources::WriteMode;
pub use slot::{SlotStage, UNIFORM_ALIGNMENT};
pub use state::{ClearFlags, MAX_SAMPLER_SLOTS, MAX_TEXTURE_SLOTS, MAX_UNIFORM_SLOTS};

use std::sync::Arc;

use slotmap::SlotMap;

use crate::backend::{Backend, FrameTables, QueueKind};
use crate::buffer_pool::{BufferAllocation, BufferPools};
use crate::command::{Command, CommandList, CommandListPool};
use crate::config::DeviceConfig;
use crate::descriptor::{DescriptorHandle, DescriptorHeaps};
use crate::error::{GpuError, GpuResult};
use crate::frame::{FenceValue, FrameCounter};
use crate::handle::{BufferId, SamplerId, ShaderId, TextureId};
use crate::pipeline::{BlendState, CacheStats, DepthStencilState, PipelineCache, RasterState, StateCache, VertexLayout};
use crate::queue::CommandQueue;
use crate::resource::{
    BarrierBatch, Buffer, BufferDesc, BufferUsage, DestroyQueue, ResourceState, Texture, TextureDesc, TextureUsage,
};

use self::resources::{SamplerEntry, TextureParts};
use self::slot::{FrameSlot, UniformRing};
use self::state::{DirtyFlags, RenderState};

type DeviceLostCallback = Box<dyn FnMut(&GpuError) + Send>;

/// Counters describing the device's steady-state behaviour.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub frames_presented: u64,
    /// `begin_frame` calls that had to block on the GPU.
    pub blocking_waits: u64,
    pub draws: u64,
    pub pipelines: CacheStats,
    pub command_allocators: usize,
    pub command_lists: usize,
    /// Buffers held by the rename pools (discarded, pending and free).
    pub pooled_buffers: usize,
    pub peak_pooled_buffers: usize,
    /// Native allocations currently owned by the rename pools.
    pub pool_allocations: usize,
    /// Objects physically freed by reclamation sweeps.
    pub reclaimed: u64,
}

/// The command list a frame is being recorded into.
#[derive(Debug)]
struct Recording<B: Backend> {
    slot: usize,
    list: CommandList<B>,
    barriers: BarrierBatch<B>,
    pass_open: bool,
}

impl<B: Backend> Recording<B> {
    fn end_pass(&mut self) {
        if self.pass_open {
            self.list.record(Command::EndPass);
            self.pass_open = false;
        }
    }
}

/// Objects waiting for the GPU to let go of them.
#[derive(Debug)]
struct Graveyard<B: Backend> {
    buffers: DestroyQueue<BufferAllocation<B>>,
    textures: DestroyQueue<TextureParts<B>>,
    descriptors: DestroyQueue<DescriptorHandle>,
    shaders: DestroyQueue<B::Shader>,
}

impl<B: Backend> Default for Graveyard<B> {
    fn default() -> Self {
        Self {
            buffers: DestroyQueue::new(),
            textures: DestroyQueue::new(),
            descriptors: DestroyQueue::new(),
            shaders: DestroyQueue::new(),
        }
    }
}

impl<B: Backend> Graveyard<B> {
    fn len(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.descriptors.len() + self.shaders.len()
    }
}

/// Per-frame GPU command and resource lifecycle manager.
///
/// Driven from a single recording thread. See the module docs for the frame
/// state machine.
pub struct Device<B: Backend> {
    backend: Arc<B>,
    config: DeviceConfig,
    /// Frames a destroyed object waits before it is freed.
    reclaim_frames: u16,

    queue: Arc<CommandQueue<B>>,
    commands: CommandListPool<B>,
    frame: FrameCounter,
    slots: Vec<FrameSlot<B>>,
    recording: Option<Recording<B>>,

    heaps: DescriptorHeaps<B>,
    pipelines: PipelineCache<B::Pipeline>,
    blend_states: StateCache<BlendState>,
    depth_stencil_states: StateCache<DepthStencilState>,
    raster_states: StateCache<RasterState>,
    layouts: StateCache<VertexLayout>,

    buffers: SlotMap<BufferId, Buffer<B>>,
    textures: SlotMap<TextureId, Texture<B>>,
    samplers: SlotMap<SamplerId, SamplerEntry>,
    shaders: SlotMap<ShaderId, B::Shader>,
    buffer_pools: BufferPools<B>,
    graveyard: Graveyard<B>,

    state: RenderState,
    dirty: DirtyFlags,
    display: Vec<TextureId>,
    depth_target: Option<TextureId>,

    lost: Option<GpuError>,
    on_device_lost: Option<DeviceLostCallback>,
    stats: FrameStats,
}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("frame", &self.frame)
            .field("slots", &self.slots.len())
            .field("recording", &self.recording.is_some())
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("lost", &self.lost)
            .finish()
    }
}

impl<B: Backend> Device<B> {
    /// Creates the frame ring, display images and default depth target.
    pub fn new(backend: Arc<B>, config: DeviceConfig) -> GpuResult<Self> {
        config.validate()?;
        let frames = config.back_buffer_count;

        // An object destroyed in frame F may be read until F's fence completes,
        // which begin_frame only guarantees N frames later.
        let reclaim_frames = config.free_frames.max(frames as u16);
        if reclaim_frames != config.free_frames {
            log::debug!(
                "reclamation threshold raised from {} to {reclaim_frames} frames for {frames} frames in flight",
                config.free_frames
            );
        }

        let queue = Arc::new(CommandQueue::new(Arc::clone(&backend), QueueKind::Graphics));
        let sizes = config.heap_sizes;

        let mut slots = Vec::with_capacity(frames);
        for _ in 0..frames {
            let usage = BufferUsage::UNIFORM | BufferUsage::MAP_WRITE;
            let desc = BufferDesc::new(config.uniform_ring_size, usage).with_label("uniform ring");
            let native = backend.create_buffer(&desc)?;
            let ring = UniformRing::new(BufferAllocation::new(native, usage, config.uniform_ring_size));
            slots.push(FrameSlot::new(sizes.shader_visible_resources, sizes.shader_visible_samplers, ring));
        }

        let mut blend_states = StateCache::new("blend");
        let mut depth_stencil_states = StateCache::new("depth-stencil");
        let mut raster_states = StateCache::new("raster");
        let mut layouts = StateCache::new("input layout");
        let state = RenderState::new(
            blend_states.intern(BlendState::default()),
            depth_stencil_states.intern(DepthStencilState::default()),
            raster_states.intern(RasterState::default()),
            layouts.intern(VertexLayout::default()),
            &config,
        );

        let mut device = Self {
            commands: CommandListPool::new(Arc::clone(&queue)),
            queue,
            backend,
            reclaim_frames,
            frame: FrameCounter::default(),
            slots,
            recording: None,
            heaps: DescriptorHeaps::new(&sizes),
            pipelines: PipelineCache::new(),
            blend_states,
            depth_stencil_states,
            raster_states,
            layouts,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shaders: SlotMap::with_key(),
            buffer_pools: BufferPools::new(frames - 1),
            graveyard: Graveyard::default(),
            state,
            dirty: DirtyFlags::all(),
            display: Vec::with_capacity(frames),
            depth_target: None,
            lost: None,
            on_device_lost: None,
            stats: FrameStats::default(),
            config,
        };

        for i in 0..frames {
            let desc = TextureDesc {
                sample_count: device.config.sample_count,
                ..TextureDesc::new_2d(
                    device.config.width,
                    device.config.height,
                    device.config.color_format,
                    TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
                )
            }
            .with_label(format!("display {i}"));
            let id = device.create_texture_inner(desc, true)?;
            device.display.push(id);
        }

        if let Some(format) = device.config.depth_format {
            let desc = TextureDesc {
                sample_count: device.config.sample_count,
                ..TextureDesc::new_2d(
                    device.config.width,
                    device.config.height,
                    format,
                    TextureUsage::DEPTH_STENCIL,
                )
            }
            .with_label("default depth");
            device.depth_target = Some(device.create_texture_inner(desc, false)?);
        }

        log::info!(
            "device ready: {} frames in flight, {}x{} {:?}, depth {:?}",
            frames,
            device.config.width,
            device.config.height,
            device.config.color_format,
            device.config.depth_format
        );
        Ok(device)
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn queue(&self) -> &Arc<CommandQueue<B>> {
        &self.queue
    }

    /// The frame being recorded, or the next one to be.
    #[inline]
    pub fn frame(&self) -> FrameCounter {
        self.frame
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Display image of frame slot `index`.
    pub fn display_image(&self, index: usize) -> Option<TextureId> {
        self.display.get(index).copied()
    }

    pub fn default_depth_target(&self) -> Option<TextureId> {
        self.depth_target
    }

    /// Registers the callback invoked once when the device is lost.
    pub fn set_device_lost_callback(&mut self, callback: impl FnMut(&GpuError) + Send + 'static) {
        self.on_device_lost = Some(Box::new(callback));
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            pipelines: self.pipelines.stats(),
            command_allocators: self.commands.allocator_count(),
            command_lists: self.commands.list_count(),
            pooled_buffers: self.buffer_pools.pooled_count(),
            peak_pooled_buffers: self.buffer_pools.peak_pooled(),
            pool_allocations: self.buffer_pools.allocated_count(),
            ..self.stats
        }
    }

    /// Objects destroyed but not yet freed.
    pub fn pending_destroys(&self) -> usize {
        self.graveyard.len()
    }

    /// Lifecycle stage of frame slot `index`.
    pub fn slot_status(&self, index: usize) -> Option<SlotStage> {
        let slot = self.slots.get(index)?;
        Some(match slot.stage {
            SlotStage::Submitted if self.queue.is_complete(slot.fence).unwrap_or(false) => SlotStage::Complete,
            stage => stage,
        })
    }

    /// Fence value recorded by the last present of slot `index`.
    pub fn slot_fence(&self, index: usize) -> Option<FenceValue> {
        self.slots.get(index).map(|slot| slot.fence)
    }

    // ── frame loop ────────────────────────────────────────────────────────

    /// Starts recording the next frame and returns its slot index.
    ///
    /// Blocks until the GPU has finished the frame that last used the slot.
    pub fn begin_frame(&mut self) -> GpuResult<usize> {
        self.ensure_alive()?;
        if self.recording.is_some() {
            return Err(GpuError::AlreadyRecording);
        }
        let index = self.frame.slot(self.slots.len());
        self.wait_slot(index)?;
        self.reclaim();

        let slot = &mut self.slots[index];
        slot.reset();
        slot.stage = SlotStage::Recording;

        let list = match self.commands.begin() {
            Ok(list) => list,
            Err(err) => return Err(self.escalate(err)),
        };
        let mut recording = Recording {
            slot: index,
            list,
            barriers: BarrierBatch::new(),
            pass_open: false,
        };

        let display = self.display[index];
        if let Some(image) = self.textures.get_mut(display) {
            image.mark_used(self.frame);
            image.transition_batched(&mut recording.barriers, ResourceState::RenderTarget);
        }
        self.recording = Some(recording);

        self.state.reset_targets(display, self.depth_target, &self.config);
        self.state.clear_transient_uniforms();
        self.dirty = DirtyFlags::all();
        log::trace!("frame {}: recording into slot {index}", self.frame.get());
        Ok(index)
    }

    /// Submits the frame, hands the display image to the presentation engine
    /// and advances the frame counter.
    pub fn present(&mut self, sync_interval: u32) -> GpuResult<()> {
        self.ensure_alive()?;
        let mut recording = self.recording.take().ok_or(GpuError::NotRecording)?;
        let index = recording.slot;
        let display = self.display[index];

        recording.end_pass();
        let native = match self.textures.get_mut(display) {
            Some(image) => {
                image.transition_batched(&mut recording.barriers, ResourceState::Present);
                image.native().clone()
            }
            None => return Err(GpuError::StaleHandle("display image")),
        };
        recording.barriers.flush(&mut recording.list);

        let slot = &mut self.slots[index];
        let tables = FrameTables {
            textures: &slot.textures,
            samplers: &slot.samplers,
        };
        let submitted = self.commands.close(recording.list, Some(tables), false);
        let fence = match submitted {
            Ok(fence) => fence,
            Err(err) => {
                slot.stage = SlotStage::Idle;
                return Err(self.escalate(err));
            }
        };
        slot.fence = fence;
        slot.stage = SlotStage::Submitted;

        // The frame's work is on the GPU whether or not the flip succeeds.
        self.buffer_pools.rotate();
        self.frame = self.frame.next();
        if let Err(err) = self.backend.present(&native, sync_interval) {
            return Err(self.escalate(err));
        }

        self.stats.frames_presented += 1;
        log::trace!("frame {} presented (fence {})", self.frame.get() - 1, fence.get());
        Ok(())
    }

    /// Blocks until every submitted frame has completed, then reclaims what
    /// is old enough.
    pub fn wait_for_gpu(&mut self) -> GpuResult<()> {
        self.ensure_alive()?;
        if let Err(err) = self.queue.wait_idle() {
            return Err(self.escalate(err));
        }
        for slot in &mut self.slots {
            if slot.stage == SlotStage::Submitted {
                slot.stage = SlotStage::Complete;
            }
        }
        self.reclaim();
        Ok(())
    }

    /// Waits for the fence guarding slot `index`, if it has not completed.
    fn wait_slot(&mut self, index: usize) -> GpuResult<()> {
        let fence = self.slots[index].fence;
        let complete = match self.queue.is_complete(fence) {
            Ok(complete) => complete,
            Err(err) => return Err(self.escalate(err)),
        };
        if !complete {
            log::trace!("slot {index}: waiting for fence {}", fence.get());
            self.stats.blocking_waits += 1;
            if let Err(err) = self.queue.wait_blocking(fence) {
                return Err(self.escalate(err));
            }
        }
        let slot = &mut self.slots[index];
        if slot.stage == SlotStage::Submitted {
            slot.stage = SlotStage::Complete;
        }
        Ok(())
    }

    /// Makes sure allocations handed out before the next `begin_frame` cannot
    /// alias memory the GPU is still reading.
    fn wait_next_slot(&mut self) -> GpuResult<()> {
        if self.recording.is_some() {
            return Ok(());
        }
        let index = self.frame.slot(self.slots.len());
        self.wait_slot(index)
    }

    /// Frees everything destroyed at least `reclaim_frames` frames ago.
    fn reclaim(&mut self) {
        let current = self.frame;
        let age = self.reclaim_frames;
        let mut freed = 0u64;

        for allocation in self.graveyard.buffers.sweep(current, age) {
            self.backend.destroy_buffer(allocation.into_native());
            freed += 1;
        }
        for (native, views) in self.graveyard.textures.sweep(current, age) {
            for handle in [views.shader, views.render, views.depth].into_iter().flatten() {
                self.heaps.free(handle);
            }
            self.backend.destroy_texture(native);
            freed += 1;
        }
        for handle in self.graveyard.descriptors.sweep(current, age) {
            self.heaps.free(handle);
            freed += 1;
        }
        freed += self.graveyard.shaders.sweep(current, age).len() as u64;

        freed += (self.blend_states.sweep(current, age)
            + self.depth_stencil_states.sweep(current, age)
            + self.raster_states.sweep(current, age)
            + self.layouts.sweep(current, age)) as u64;

        if freed > 0 {
            log::debug!("frame {}: reclaimed {freed} objects", current.get());
            self.stats.reclaimed += freed;
        }
    }

    // ── device loss ───────────────────────────────────────────────────────

    fn ensure_alive(&self) -> GpuResult<()> {
        match &self.lost {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Routes a native failure. Device loss is latched and reported to the
    /// callback once; every later GPU call is refused.
    fn escalate(&mut self, err: GpuError) -> GpuError {
        if err.is_device_lost() && self.lost.is_none() {
            log::error!("{err}; refusing further GPU work");
            self.lost = Some(err.clone());
            if let Some(recording) = self.recording.take() {
                self.commands.abandon(recording.list);
            }
            if let Some(callback) = self.on_device_lost.as_mut() {
                callback(&err);
            }
        }
        err
    }

    fn teardown(&mut self) {
        if let Some(recording) = self.recording.take() {
            self.commands.abandon(recording.list);
        }
        if self.lost.is_none() {
            if let Err(err) = self.queue.wait_idle() {
                log::error!("teardown: {err}");
            }
        }

        for allocation in self.graveyard.buffers.drain_all() {
            self.backend.destroy_buffer(allocation.into_native());
        }
        for (native, _) in self.graveyard.textures.drain_all() {
            self.backend.destroy_texture(native);
        }
        self.graveyard.descriptors.drain_all();
        self.graveyard.shaders.drain_all();

        self.buffer_pools.drain_all(&self.backend);
        for (_, buffer) in self.buffers.drain() {
            let allocation = buffer.into_allocation();
            self.backend.destroy_buffer(allocation.into_native());
        }
        for (_, texture) in self.textures.drain() {
            let (native, _) = texture.into_parts();
            self.backend.destroy_texture(native);
        }
        for slot in self.slots.drain(..) {
            self.backend.destroy_buffer(slot.uniforms.into_allocation().into_native());
        }
        self.pipelines.clear();
        log::debug!("device torn down after {} frames", self.stats.frames_presented);
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
