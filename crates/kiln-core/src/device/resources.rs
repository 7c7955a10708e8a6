//! Object creation and deferred destruction.

use std::sync::Arc;

use super::Device;
use crate::backend::Backend;
use crate::buffer_pool::{BufferAllocation, BufferClass};
use crate::descriptor::{DescriptorHandle, HeapKind};
use crate::error::{GpuError, GpuResult};
use crate::handle::{BufferId, SamplerId, ShaderId, TextureId};
use crate::pipeline::{BlendState, DepthStencilState, RasterState, VertexLayout};
use crate::resource::{
    Buffer, BufferDesc, BufferUsage, SamplerDesc, ShaderDesc, Texture, TextureDesc, TextureUsage, TextureViews,
    ViewKind,
};

/// How [`Device::map_write`] treats the previous contents.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum WriteMode {
    /// The whole buffer is replaced. Dynamic buffers get a fresh backing
    /// allocation; the GPU keeps reading the old one until it is done.
    Discard,
    /// The caller promises not to touch bytes an in-flight frame still reads.
    NoOverwrite,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct SamplerEntry {
    handle: DescriptorHandle,
}

impl SamplerEntry {
    #[inline]
    pub fn handle(&self) -> DescriptorHandle {
        self.handle
    }
}

/// What a destroyed texture leaves behind until it is reclaimed.
pub(crate) type TextureParts<B> = (<B as Backend>::Texture, TextureViews);

impl<B: Backend> Device<B> {
    // ── buffers ───────────────────────────────────────────────────────────

    /// Creates a buffer, optionally filled with `data`.
    ///
    /// Dynamic buffers come from the rename pools and are CPU-writable.
    pub fn create_buffer(&mut self, desc: BufferDesc, data: Option<&[u8]>) -> GpuResult<BufferId> {
        self.ensure_alive()?;
        if desc.size == 0 {
            return Err(GpuError::InvalidConfig("buffer size must be non-zero".into()));
        }
        if data.is_some_and(|d| d.len() as u64 > desc.size) {
            return Err(GpuError::InvalidConfig("initial data larger than the buffer".into()));
        }

        let id = if desc.dynamic {
            let desc = BufferDesc {
                usage: desc.usage | BufferUsage::MAP_WRITE,
                ..desc
            };
            self.wait_next_slot()?;
            let class = BufferClass::of(desc.usage);
            let acquired = self.buffer_pools.get_mut(class).acquire(&self.backend, &desc, desc.size);
            let allocation = match acquired {
                Ok(allocation) => allocation,
                Err(err) => return Err(self.escalate(err)),
            };
            if let Some(data) = data {
                if let Err(err) = self.backend.write_buffer(allocation.native(), 0, data) {
                    return Err(self.escalate(err));
                }
            }
            self.buffers.insert(Buffer::new(allocation, desc, self.frame))
        } else {
            let desc = match data {
                Some(_) => BufferDesc {
                    usage: desc.usage | BufferUsage::COPY_DST,
                    ..desc
                },
                None => desc,
            };
            let native = match self.backend.create_buffer(&desc) {
                Ok(native) => native,
                Err(err) => return Err(self.escalate(err)),
            };
            let allocation = BufferAllocation::new(native, desc.usage, desc.size);
            let id = self.buffers.insert(Buffer::new(allocation, desc, self.frame));
            if let Some(data) = data {
                self.upload_buffer(id, 0, data)?;
            }
            id
        };
        log::trace!("created buffer {id:?}");
        Ok(id)
    }

    /// Enqueues a buffer for destruction. The handle is invalid at once; the
    /// memory is freed once no in-flight frame can read it.
    pub fn destroy_buffer(&mut self, id: BufferId) -> GpuResult<()> {
        let buffer = self.buffers.remove(id).ok_or(GpuError::StaleHandle("buffer"))?;
        let dynamic = buffer.desc().dynamic;
        let class = BufferClass::of(buffer.desc().usage);
        let allocation = buffer.into_allocation();
        if dynamic {
            self.buffer_pools.get_mut(class).retire(allocation);
        } else {
            self.graveyard.buffers.push(self.frame, allocation);
        }
        Ok(())
    }

    /// Writes `data` at `offset` into a buffer.
    pub fn map_write(&mut self, id: BufferId, offset: u64, data: &[u8], mode: WriteMode) -> GpuResult<()> {
        self.ensure_alive()?;
        let buffer = self.buffers.get(id).ok_or(GpuError::StaleHandle("buffer"))?;
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > buffer.desc().size) {
            return Err(GpuError::InvalidConfig(format!(
                "write of {} bytes at {offset} overruns buffer of {} bytes",
                data.len(),
                buffer.desc().size
            )));
        }

        match (mode, buffer.desc().dynamic) {
            (WriteMode::Discard, true) => self.rename(id, offset, data),
            (WriteMode::Discard, false) => self.upload_buffer(id, offset, data),
            (WriteMode::NoOverwrite, _) => {
                let frame = self.frame;
                let Some(buffer) = self.buffers.get_mut(id) else {
                    return Err(GpuError::StaleHandle("buffer"));
                };
                buffer.mark_used(frame);
                match self.backend.write_buffer(buffer.native(), offset, data) {
                    Ok(()) => Ok(()),
                    Err(err) => Err(self.escalate(err)),
                }
            }
        }
    }

    /// Swaps a fresh allocation under a dynamic buffer and writes into it.
    fn rename(&mut self, id: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.wait_next_slot()?;
        let Self {
            backend,
            buffers,
            buffer_pools,
            frame,
            ..
        } = self;
        let buffer = buffers.get_mut(id).ok_or(GpuError::StaleHandle("buffer"))?;
        let desc = buffer.desc().clone();
        let old_id = buffer.allocation().id();
        let renamed = buffer_pools
            .get_mut(BufferClass::of(desc.usage))
            .discard(backend, buffer.allocation_mut(), &desc, desc.size)
            .and_then(|()| backend.write_buffer(buffer.native(), offset, data));
        if let Err(err) = renamed {
            return Err(self.escalate(err));
        }
        buffer.mark_used(*frame);
        log::trace!("buffer {id:?}: renamed allocation {old_id} -> {}", buffer.allocation().id());

        // Bound slots still point at the retired allocation.
        self.dirty |= self.state.binds_buffer(id);
        Ok(())
    }

    // ── textures ──────────────────────────────────────────────────────────

    pub fn create_texture(&mut self, desc: TextureDesc) -> GpuResult<TextureId> {
        self.ensure_alive()?;
        self.create_texture_inner(desc, false)
    }

    pub(super) fn create_texture_inner(&mut self, desc: TextureDesc, is_display: bool) -> GpuResult<TextureId> {
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 || desc.mip_levels == 0 {
            return Err(GpuError::InvalidConfig("texture dimensions must be non-zero".into()));
        }
        if !matches!(desc.sample_count, 1 | 2 | 4 | 8) {
            return Err(GpuError::InvalidConfig(format!("unsupported sample count {}", desc.sample_count)));
        }
        if desc.usage.contains(TextureUsage::DEPTH_STENCIL) != desc.format.is_depth() {
            return Err(GpuError::InvalidConfig(format!(
                "{:?} does not match usage {:?}",
                desc.format, desc.usage
            )));
        }

        let native = match self.backend.create_texture(&desc) {
            Ok(native) => native,
            Err(err) => return Err(self.escalate(err)),
        };
        let mut views = TextureViews::default();
        if let Err(err) = self.create_views(&native, &desc, &mut views) {
            for handle in [views.shader, views.render, views.depth].into_iter().flatten() {
                self.heaps.free(handle);
            }
            self.backend.destroy_texture(native);
            return Err(self.escalate(err));
        }

        log::debug!(
            "created {}texture {:?} {}x{} {:?}",
            if is_display { "display " } else { "" },
            desc.label.as_deref().unwrap_or("<unnamed>"),
            desc.width,
            desc.height,
            desc.format
        );
        Ok(self.textures.insert(Texture::new(native, desc, is_display, views, self.frame)))
    }

    /// Claims a heap slot and writes a view for every usage that needs one.
    fn create_views(&mut self, native: &B::Texture, desc: &TextureDesc, views: &mut TextureViews) -> GpuResult<()> {
        let wanted = [
            (TextureUsage::SAMPLED, ViewKind::ShaderResource, HeapKind::ShaderResource),
            (TextureUsage::RENDER_TARGET, ViewKind::RenderTarget, HeapKind::RenderTarget),
            (TextureUsage::DEPTH_STENCIL, ViewKind::DepthStencil, HeapKind::DepthStencil),
        ];
        for (usage, kind, heap_kind) in wanted {
            if !desc.usage.contains(usage) {
                continue;
            }
            let Some(heap) = self.heaps.views_mut(heap_kind) else {
                continue;
            };
            let handle = heap.alloc_handle()?;
            let slot = match kind {
                ViewKind::ShaderResource => &mut views.shader,
                ViewKind::RenderTarget => &mut views.render,
                ViewKind::DepthStencil => &mut views.depth,
            };
            *slot = Some(handle);
            let view = self.backend.create_view(native, desc, kind)?;
            heap.write(handle, view)?;
        }
        Ok(())
    }

    /// Enqueues a texture and its views for destruction.
    ///
    /// Display images belong to the device and cannot be destroyed.
    pub fn destroy_texture(&mut self, id: TextureId) -> GpuResult<()> {
        let texture = self.textures.get(id).ok_or(GpuError::StaleHandle("texture"))?;
        if texture.is_display() || self.depth_target == Some(id) {
            return Err(GpuError::InvalidConfig("device-owned targets cannot be destroyed".into()));
        }
        if let Some(texture) = self.textures.remove(id) {
            self.graveyard.textures.push(self.frame, texture.into_parts());
        }
        Ok(())
    }

    // ── samplers ──────────────────────────────────────────────────────────

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> GpuResult<SamplerId> {
        self.ensure_alive()?;
        let handle = self.heaps.sampler.alloc_handle()?;
        let written = self
            .backend
            .create_sampler(desc)
            .and_then(|native| self.heaps.sampler.write(handle, native));
        if let Err(err) = written {
            self.heaps.sampler.free_handle(handle);
            return Err(self.escalate(err));
        }
        Ok(self.samplers.insert(SamplerEntry { handle }))
    }

    pub fn destroy_sampler(&mut self, id: SamplerId) -> GpuResult<()> {
        let entry = self.samplers.remove(id).ok_or(GpuError::StaleHandle("sampler"))?;
        self.graveyard.descriptors.push(self.frame, entry.handle);
        Ok(())
    }

    // ── shaders ───────────────────────────────────────────────────────────

    pub fn create_shader(&mut self, desc: &ShaderDesc) -> GpuResult<ShaderId> {
        self.ensure_alive()?;
        match self.backend.create_shader(desc) {
            Ok(native) => Ok(self.shaders.insert(native)),
            Err(err) => Err(self.escalate(err)),
        }
    }

    /// Pipelines already built from the shader stay valid.
    pub fn destroy_shader(&mut self, id: ShaderId) -> GpuResult<()> {
        let native = self.shaders.remove(id).ok_or(GpuError::StaleHandle("shader"))?;
        self.graveyard.shaders.push(self.frame, native);
        Ok(())
    }

    // ── queries ───────────────────────────────────────────────────────────

    /// Claims a query slot.
    pub fn create_query(&mut self) -> GpuResult<DescriptorHandle> {
        self.ensure_alive()?;
        let handle = self.heaps.query.alloc_handle()?;
        self.heaps.query.write(handle, ())?;
        Ok(handle)
    }

    pub fn destroy_query(&mut self, handle: DescriptorHandle) -> GpuResult<()> {
        if handle.kind() != HeapKind::Query || !self.heaps.query.is_live(handle) {
            return Err(GpuError::StaleHandle("query"));
        }
        self.graveyard.descriptors.push(self.frame, handle);
        Ok(())
    }

    // ── state objects ─────────────────────────────────────────────────────

    /// Returns the shared handle for `layout`. Identical layouts share one.
    pub fn create_input_layout(&mut self, layout: VertexLayout) -> Arc<VertexLayout> {
        self.layouts.intern(layout)
    }

    pub fn create_blend_state(&mut self, state: BlendState) -> Arc<BlendState> {
        self.blend_states.intern(state)
    }

    pub fn create_depth_stencil_state(&mut self, state: DepthStencilState) -> Arc<DepthStencilState> {
        self.depth_stencil_states.intern(state)
    }

    pub fn create_raster_state(&mut self, state: RasterState) -> Arc<RasterState> {
        self.raster_states.intern(state)
    }

    // ── inspection ────────────────────────────────────────────────────────

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer<B>> {
        self.buffers.get(id)
    }

    pub fn texture(&self, id: TextureId) -> Option<&Texture<B>> {
        self.textures.get(id)
    }
}
