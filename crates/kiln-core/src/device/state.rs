//! Dirty-tracked render state and its resolution before each draw.

use std::sync::Arc;

use bitflags::bitflags;
use slotmap::SlotMap;

use super::{Device, Recording, SamplerEntry};
use crate::backend::Backend;
use crate::command::{ColorAttachment, Command, DepthAttachment, ScissorRect, Viewport};
use crate::config::DeviceConfig;
use crate::descriptor::{DescriptorHandle, DescriptorHeaps};
use crate::error::{GpuError, GpuResult};
use crate::format::{IndexFormat, PrimitiveTopology, ShaderStage};
use crate::frame::FrameCounter;
use crate::handle::{BufferId, SamplerId, ShaderId, TextureId};
use crate::pipeline::{
    BlendState, DepthStencilState, PipelineDesc, RasterState, VertexLayout, MAX_COLOR_TARGETS, MAX_VERTEX_BUFFERS,
};
use crate::resource::{ResourceState, Texture};

pub const MAX_TEXTURE_SLOTS: usize = 16;
pub const MAX_SAMPLER_SLOTS: usize = 16;
/// Uniform buffer slots per shader stage.
pub const MAX_UNIFORM_SLOTS: usize = 8;

bitflags! {
    /// State groups changed since the last draw.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub(crate) struct DirtyFlags: u32 {
        const PIPELINE       = 1 << 0;
        const VERTEX_BUFFERS = 1 << 1;
        const INDEX_BUFFER   = 1 << 2;
        const UNIFORMS       = 1 << 3;
        const TEXTURES       = 1 << 4;
        const SAMPLERS       = 1 << 5;
        const TARGETS        = 1 << 6;
        const VIEWPORT       = 1 << 7;
        const SCISSOR        = 1 << 8;
    }
}

bitflags! {
    /// Which aspects of the bound targets `clear` resets.
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
    pub struct ClearFlags: u8 {
        const COLOR   = 1 << 0;
        const DEPTH   = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct VertexBinding {
    pub buffer: BufferId,
    pub offset: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct IndexBinding {
    pub buffer: BufferId,
    pub offset: u64,
    pub format: IndexFormat,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum UniformBinding {
    /// A whole device buffer.
    Buffer(BufferId),
    /// A range of the current slot's uniform ring.
    Transient { offset: u64, size: u64 },
}

/// Everything the next draw will use.
#[derive(Debug)]
pub(crate) struct RenderState {
    pub blend: Arc<BlendState>,
    pub depth_stencil: Arc<DepthStencilState>,
    pub raster: Arc<RasterState>,
    pub layout: Arc<VertexLayout>,
    pub vertex_shader: Option<ShaderId>,
    pub fragment_shader: Option<ShaderId>,
    pub topology: PrimitiveTopology,
    pub vertex_buffers: [Option<VertexBinding>; MAX_VERTEX_BUFFERS],
    pub index_buffer: Option<IndexBinding>,
    pub uniforms: [[Option<UniformBinding>; MAX_UNIFORM_SLOTS]; ShaderStage::COUNT],
    pub textures: [Option<TextureId>; MAX_TEXTURE_SLOTS],
    pub samplers: [Option<SamplerId>; MAX_SAMPLER_SLOTS],
    pub color_targets: Vec<TextureId>,
    pub depth_target: Option<TextureId>,
    pub viewport: Viewport,
    pub scissor: Option<ScissorRect>,
}

impl RenderState {
    pub fn new(
        blend: Arc<BlendState>,
        depth_stencil: Arc<DepthStencilState>,
        raster: Arc<RasterState>,
        layout: Arc<VertexLayout>,
        config: &DeviceConfig,
    ) -> Self {
        Self {
            blend,
            depth_stencil,
            raster,
            layout,
            vertex_shader: None,
            fragment_shader: None,
            topology: PrimitiveTopology::default(),
            vertex_buffers: [None; MAX_VERTEX_BUFFERS],
            index_buffer: None,
            uniforms: [[None; MAX_UNIFORM_SLOTS]; ShaderStage::COUNT],
            textures: [None; MAX_TEXTURE_SLOTS],
            samplers: [None; MAX_SAMPLER_SLOTS],
            color_targets: Vec::new(),
            depth_target: None,
            viewport: Viewport::new(config.width as f32, config.height as f32),
            scissor: None,
        }
    }

    /// Points the targets back at the frame's display image.
    pub fn reset_targets(&mut self, display: TextureId, depth: Option<TextureId>, config: &DeviceConfig) {
        self.color_targets.clear();
        self.color_targets.push(display);
        self.depth_target = depth;
        self.viewport = Viewport::new(config.width as f32, config.height as f32);
        self.scissor = None;
    }

    /// Unbinds ring allocations made for a previous frame.
    pub fn clear_transient_uniforms(&mut self) {
        for binding in self.uniforms.iter_mut().flatten() {
            if matches!(binding, Some(UniformBinding::Transient { .. })) {
                *binding = None;
            }
        }
    }

    /// Whether `id` is bound as a vertex, index or constant buffer.
    pub fn binds_buffer(&self, id: BufferId) -> DirtyFlags {
        let mut flags = DirtyFlags::empty();
        if self.vertex_buffers.iter().flatten().any(|b| b.buffer == id) {
            flags |= DirtyFlags::VERTEX_BUFFERS;
        }
        if self.index_buffer.is_some_and(|b| b.buffer == id) {
            flags |= DirtyFlags::INDEX_BUFFER;
        }
        if self
            .uniforms
            .iter()
            .flatten()
            .flatten()
            .any(|u| *u == UniformBinding::Buffer(id))
        {
            flags |= DirtyFlags::UNIFORMS;
        }
        flags
    }

    /// Buffers bound for the next draw.
    pub fn bound_buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        let vertex = self.vertex_buffers.iter().flatten().map(|b| b.buffer);
        let index = self.index_buffer.iter().map(|b| b.buffer);
        let uniforms = self.uniforms.iter().flatten().flatten().filter_map(|u| match u {
            UniformBinding::Buffer(id) => Some(*id),
            UniformBinding::Transient { .. } => None,
        });
        vertex.chain(index).chain(uniforms)
    }
}

/// Clear values for a pass that starts by clearing.
#[derive(Debug, Copy, Clone)]
struct PassClear {
    flags: ClearFlags,
    color: [f64; 4],
    depth: f32,
    stencil: u32,
}

/// Transitions the bound targets and opens a render pass on them.
fn begin_pass<B: Backend>(
    recording: &mut Recording<B>,
    textures: &mut SlotMap<TextureId, Texture<B>>,
    heaps: &DescriptorHeaps<B>,
    state: &RenderState,
    frame: FrameCounter,
    clear: Option<PassClear>,
) -> GpuResult<()> {
    let mut colors = Vec::with_capacity(state.color_targets.len());
    for &id in &state.color_targets {
        let target = textures.get_mut(id).ok_or(GpuError::StaleHandle("render target"))?;
        target.mark_used(frame);
        target.transition_batched(&mut recording.barriers, ResourceState::RenderTarget);
        let view = target
            .render_view()
            .and_then(|h| heaps.render_target.get(h))
            .ok_or(GpuError::IncompleteState("render target view"))?;
        colors.push(ColorAttachment {
            view: view.clone(),
            clear: clear.filter(|c| c.flags.contains(ClearFlags::COLOR)).map(|c| c.color),
        });
    }

    let depth = match state.depth_target {
        Some(id) => {
            let target = textures.get_mut(id).ok_or(GpuError::StaleHandle("depth target"))?;
            target.mark_used(frame);
            target.transition_batched(&mut recording.barriers, ResourceState::DepthWrite);
            let view = target
                .depth_view()
                .and_then(|h| heaps.depth_stencil.get(h))
                .ok_or(GpuError::IncompleteState("depth-stencil view"))?;
            let has_stencil = target.desc().format.has_stencil();
            Some(DepthAttachment {
                view: view.clone(),
                clear_depth: clear.filter(|c| c.flags.contains(ClearFlags::DEPTH)).map(|c| c.depth),
                clear_stencil: clear
                    .filter(|c| has_stencil && c.flags.contains(ClearFlags::STENCIL))
                    .map(|c| c.stencil),
                has_stencil,
            })
        }
        None => None,
    };

    recording.barriers.flush(&mut recording.list);
    recording.list.record(Command::BeginPass { colors, depth });
    recording.pass_open = true;
    Ok(())
}

/// Shader-visible handles for the bound slots, trimmed after the last bound one.
fn bound_handles<T: Copy>(slots: &[Option<T>], resolve: impl Fn(T) -> Option<DescriptorHandle>) -> Vec<Option<DescriptorHandle>> {
    let used = slots.iter().rposition(Option::is_some).map_or(0, |last| last + 1);
    slots[..used].iter().map(|slot| slot.and_then(&resolve)).collect()
}

impl<B: Backend> Device<B> {
    // ── fixed-function state ──────────────────────────────────────────────

    pub fn set_blend_state(&mut self, blend: Arc<BlendState>) {
        if !Arc::ptr_eq(&self.state.blend, &blend) {
            self.state.blend = blend;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    pub fn set_depth_stencil_state(&mut self, depth_stencil: Arc<DepthStencilState>) {
        if !Arc::ptr_eq(&self.state.depth_stencil, &depth_stencil) {
            self.state.depth_stencil = depth_stencil;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    pub fn set_raster_state(&mut self, raster: Arc<RasterState>) {
        if !Arc::ptr_eq(&self.state.raster, &raster) {
            self.state.raster = raster;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    pub fn set_input_layout(&mut self, layout: Arc<VertexLayout>) {
        if !Arc::ptr_eq(&self.state.layout, &layout) {
            self.state.layout = layout;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    pub fn set_shaders(&mut self, vertex: ShaderId, fragment: Option<ShaderId>) {
        if self.state.vertex_shader != Some(vertex) || self.state.fragment_shader != fragment {
            self.state.vertex_shader = Some(vertex);
            self.state.fragment_shader = fragment;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        if self.state.topology != topology {
            self.state.topology = topology;
            self.dirty |= DirtyFlags::PIPELINE;
        }
    }

    // ── bindings ──────────────────────────────────────────────────────────

    pub fn set_vertex_buffer(&mut self, slot: usize, buffer: Option<BufferId>, offset: u64) {
        let binding = buffer.map(|buffer| VertexBinding { buffer, offset });
        match self.state.vertex_buffers.get_mut(slot) {
            Some(current) if *current != binding => {
                *current = binding;
                self.dirty |= DirtyFlags::VERTEX_BUFFERS;
            }
            Some(_) => {}
            None => log::warn!("vertex buffer slot {slot} out of range"),
        }
    }

    pub fn set_index_buffer(&mut self, buffer: Option<BufferId>, offset: u64, format: IndexFormat) {
        let binding = buffer.map(|buffer| IndexBinding { buffer, offset, format });
        if self.state.index_buffer != binding {
            self.state.index_buffer = binding;
            self.dirty |= DirtyFlags::INDEX_BUFFER;
        }
    }

    /// Binds a whole buffer as uniform slot `slot` of `stage`.
    pub fn set_constant_buffer(&mut self, stage: ShaderStage, slot: usize, buffer: Option<BufferId>) {
        self.set_uniform_binding(stage, slot, buffer.map(UniformBinding::Buffer));
    }

    /// Copies `data` into this frame's uniform ring and binds it.
    pub fn set_uniform_data(&mut self, stage: ShaderStage, slot: usize, data: &[u8]) -> GpuResult<()> {
        self.ensure_alive()?;
        let index = self.recording.as_ref().ok_or(GpuError::NotRecording)?.slot;
        let ring = &mut self.slots[index].uniforms;
        let offset = ring.alloc(data.len() as u64)?;
        if let Err(err) = self.backend.write_buffer(ring.native(), offset, data) {
            return Err(self.escalate(err));
        }
        let binding = UniformBinding::Transient {
            offset,
            size: data.len() as u64,
        };
        self.set_uniform_binding(stage, slot, Some(binding));
        Ok(())
    }

    fn set_uniform_binding(&mut self, stage: ShaderStage, slot: usize, binding: Option<UniformBinding>) {
        match self.state.uniforms[stage.index()].get_mut(slot) {
            Some(current) if *current != binding => {
                *current = binding;
                self.dirty |= DirtyFlags::UNIFORMS;
            }
            Some(_) => {}
            None => log::warn!("{stage:?} uniform slot {slot} out of range"),
        }
    }

    pub fn set_texture(&mut self, slot: usize, texture: Option<TextureId>) {
        match self.state.textures.get_mut(slot) {
            Some(current) if *current != texture => {
                *current = texture;
                self.dirty |= DirtyFlags::TEXTURES;
            }
            Some(_) => {}
            None => log::warn!("texture slot {slot} out of range"),
        }
    }

    pub fn set_sampler(&mut self, slot: usize, sampler: Option<SamplerId>) {
        match self.state.samplers.get_mut(slot) {
            Some(current) if *current != sampler => {
                *current = sampler;
                self.dirty |= DirtyFlags::SAMPLERS;
            }
            Some(_) => {}
            None => log::warn!("sampler slot {slot} out of range"),
        }
    }

    // ── targets ───────────────────────────────────────────────────────────

    pub fn set_render_targets(&mut self, colors: &[TextureId], depth: Option<TextureId>) -> GpuResult<()> {
        if colors.len() > MAX_COLOR_TARGETS {
            return Err(GpuError::InvalidConfig(format!(
                "{} color targets bound, at most {MAX_COLOR_TARGETS} supported",
                colors.len()
            )));
        }
        if self.state.color_targets != colors || self.state.depth_target != depth {
            self.state.color_targets.clear();
            self.state.color_targets.extend_from_slice(colors);
            self.state.depth_target = depth;
            // Target formats are part of the pipeline.
            self.dirty |= DirtyFlags::TARGETS | DirtyFlags::PIPELINE;
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.state.viewport != viewport {
            self.state.viewport = viewport;
            self.dirty |= DirtyFlags::VIEWPORT;
        }
    }

    /// `None` disables scissoring (the whole target).
    pub fn set_scissor(&mut self, scissor: Option<ScissorRect>) {
        if self.state.scissor != scissor {
            self.state.scissor = scissor;
            self.dirty |= DirtyFlags::SCISSOR;
        }
    }

    // ── draws ─────────────────────────────────────────────────────────────

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> GpuResult<()> {
        self.prepare_draw()?;
        if let Some(recording) = self.recording.as_mut() {
            recording.list.record(Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            });
        }
        self.stats.draws += 1;
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> GpuResult<()> {
        if self.state.index_buffer.is_none() {
            return Err(GpuError::IncompleteState("index buffer"));
        }
        self.prepare_draw()?;
        if let Some(recording) = self.recording.as_mut() {
            recording.list.record(Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            });
        }
        self.stats.draws += 1;
        Ok(())
    }

    /// Clears the bound targets by restarting the render pass with clear loads.
    pub fn clear(&mut self, flags: ClearFlags, color: [f64; 4], depth: f32, stencil: u32) -> GpuResult<()> {
        self.ensure_alive()?;
        let Self {
            recording,
            textures,
            heaps,
            state,
            dirty,
            frame,
            ..
        } = self;
        let recording = recording.as_mut().ok_or(GpuError::NotRecording)?;
        recording.end_pass();
        let clear = PassClear {
            flags,
            color,
            depth,
            stencil,
        };
        begin_pass(recording, textures, heaps, state, *frame, Some(clear))?;
        // A new pass starts with nothing bound.
        *dirty = DirtyFlags::all() - DirtyFlags::TARGETS;
        Ok(())
    }

    fn prepare_draw(&mut self) -> GpuResult<()> {
        self.ensure_alive()?;
        if self.recording.is_none() {
            return Err(GpuError::NotRecording);
        }
        if self.state.vertex_shader.is_none() {
            return Err(GpuError::IncompleteState("vertex shader"));
        }
        match self.apply_state() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.escalate(err)),
        }
    }

    /// Resolves dirty state into commands on the frame's list.
    fn apply_state(&mut self) -> GpuResult<()> {
        let Self {
            backend,
            config,
            recording,
            slots,
            heaps,
            pipelines,
            buffers,
            textures,
            samplers,
            shaders,
            state,
            dirty,
            frame,
            ..
        } = self;
        let frame = *frame;
        let recording = recording.as_mut().ok_or(GpuError::NotRecording)?;
        if !recording.pass_open {
            // A transfer may have moved bound resources out of their read states.
            *dirty |= DirtyFlags::all();
        }

        // Transitions first. Barriers cannot be issued inside a pass.
        if dirty.contains(DirtyFlags::TEXTURES) {
            for &id in state.textures.iter().flatten() {
                let texture = textures.get_mut(id).ok_or(GpuError::StaleHandle("texture"))?;
                texture.mark_used(frame);
                texture.transition_batched(&mut recording.barriers, ResourceState::ShaderRead);
            }
        }
        if dirty.intersects(DirtyFlags::VERTEX_BUFFERS | DirtyFlags::INDEX_BUFFER | DirtyFlags::UNIFORMS) {
            for id in state.bound_buffers() {
                let buffer = buffers.get_mut(id).ok_or(GpuError::StaleHandle("buffer"))?;
                buffer.mark_used(frame);
                buffer.transition_batched(&mut recording.barriers, ResourceState::GenericRead);
            }
        }
        if !recording.barriers.is_empty() || dirty.contains(DirtyFlags::TARGETS) {
            recording.end_pass();
        }
        if !recording.pass_open {
            begin_pass(recording, textures, heaps, state, frame, None)?;
            *dirty |= DirtyFlags::all();
        }
        dirty.remove(DirtyFlags::TARGETS);

        let slot = &mut slots[recording.slot];

        if dirty.contains(DirtyFlags::PIPELINE) {
            let vertex_id = state.vertex_shader.ok_or(GpuError::IncompleteState("vertex shader"))?;
            let vertex = shaders.get(vertex_id).ok_or(GpuError::StaleHandle("shader"))?;
            let fragment = match state.fragment_shader {
                Some(id) => Some(shaders.get(id).ok_or(GpuError::StaleHandle("shader"))?),
                None => None,
            };

            let mut color_formats = Vec::with_capacity(state.color_targets.len());
            let mut sample_count = None;
            for &id in &state.color_targets {
                let desc = textures.get(id).ok_or(GpuError::StaleHandle("render target"))?.desc();
                color_formats.push(desc.format);
                sample_count.get_or_insert(desc.sample_count);
            }
            let depth_format = match state.depth_target {
                Some(id) => {
                    let desc = textures.get(id).ok_or(GpuError::StaleHandle("depth target"))?.desc();
                    sample_count.get_or_insert(desc.sample_count);
                    Some(desc.format)
                }
                None => None,
            };

            let desc = PipelineDesc {
                vertex_shader: vertex_id,
                fragment_shader: state.fragment_shader,
                blend: Arc::clone(&state.blend),
                depth_stencil: Arc::clone(&state.depth_stencil),
                raster: Arc::clone(&state.raster),
                layout: Arc::clone(&state.layout),
                color_formats,
                depth_format,
                sample_count: sample_count.unwrap_or(config.sample_count),
                topology: state.topology,
            };
            let pipeline = pipelines.get_or_create(&desc.key(), || backend.build_pipeline(&desc, vertex, fragment))?;
            recording.list.record(Command::SetPipeline(pipeline));
        }

        if dirty.contains(DirtyFlags::VERTEX_BUFFERS) {
            for (slot, binding) in state.vertex_buffers.iter().enumerate() {
                let Some(binding) = binding else { continue };
                let buffer = buffers.get(binding.buffer).ok_or(GpuError::StaleHandle("buffer"))?;
                recording.list.record(Command::SetVertexBuffer {
                    slot: slot as u32,
                    buffer: buffer.native().clone(),
                    offset: binding.offset,
                });
            }
        }

        if dirty.contains(DirtyFlags::INDEX_BUFFER) {
            if let Some(binding) = state.index_buffer {
                let buffer = buffers.get(binding.buffer).ok_or(GpuError::StaleHandle("buffer"))?;
                recording.list.record(Command::SetIndexBuffer {
                    buffer: buffer.native().clone(),
                    offset: binding.offset,
                    format: binding.format,
                });
            }
        }

        if dirty.contains(DirtyFlags::UNIFORMS) {
            for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
                for (index, binding) in state.uniforms[stage.index()].iter().enumerate() {
                    let command = match binding {
                        None => continue,
                        Some(UniformBinding::Buffer(id)) => {
                            let buffer = buffers.get(*id).ok_or(GpuError::StaleHandle("buffer"))?;
                            Command::SetUniform {
                                stage,
                                slot: index as u32,
                                buffer: buffer.native().clone(),
                                offset: 0,
                                size: buffer.size(),
                            }
                        }
                        Some(UniformBinding::Transient { offset, size }) => Command::SetUniform {
                            stage,
                            slot: index as u32,
                            buffer: slot.uniforms.native().clone(),
                            offset: *offset,
                            size: *size,
                        },
                    };
                    recording.list.record(command);
                }
            }
        }

        if dirty.contains(DirtyFlags::TEXTURES) {
            let handles = bound_handles(&state.textures, |id| textures.get(id).and_then(Texture::shader_view));
            if !handles.is_empty() {
                let table = slot.textures.copy_table(&heaps.shader_resource, &handles)?;
                recording.list.record(Command::BindTextures(table));
            }
        }

        if dirty.contains(DirtyFlags::SAMPLERS) {
            let handles = bound_handles(&state.samplers, |id| samplers.get(id).map(SamplerEntry::handle));
            if !handles.is_empty() {
                let table = slot.samplers.copy_table(&heaps.sampler, &handles)?;
                recording.list.record(Command::BindSamplers(table));
            }
        }

        if dirty.contains(DirtyFlags::VIEWPORT) {
            recording.list.record(Command::SetViewport(state.viewport));
        }
        if dirty.contains(DirtyFlags::SCISSOR) {
            let rect = state.scissor.unwrap_or(ScissorRect {
                x: 0,
                y: 0,
                width: config.width,
                height: config.height,
            });
            recording.list.record(Command::SetScissor(rect));
        }

        *dirty = DirtyFlags::empty();
        Ok(())
    }
}
