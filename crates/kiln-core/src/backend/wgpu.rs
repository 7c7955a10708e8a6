//! Native backend on top of wgpu.
//!
//! wgpu already tracks resource states and exposes a single queue, so this
//! backend is mostly translation:
//! - recorded barriers are dropped (wgpu inserts its own)
//! - both [`QueueKind`]s map to the one wgpu queue, each with its own fence timeline
//! - fences map to submission indices; completion is reported through
//!   `on_submitted_work_done`
//! - descriptor tables become one bind group per draw (group 0)
//!
//! Bind group 0 layout, shared by every pipeline:
//! - textures at bindings `0..16`
//! - samplers at bindings `16..32`
//! - uniforms at `32 + stage * 8 + slot`
//!
//! Display images are ordinary offscreen textures; [`Backend::present`] only
//! counts the frame. Window surfaces belong to the application.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::{Backend, FrameTables, QueueKind, Submission};
use crate::command::{ColorAttachment, Command, DepthAttachment, ScissorRect, StagingLayout, Viewport};
use crate::descriptor::DescriptorTable;
use crate::device::{MAX_SAMPLER_SLOTS, MAX_TEXTURE_SLOTS, MAX_UNIFORM_SLOTS};
use crate::error::{GpuError, GpuResult};
use crate::format::{Format, IndexFormat, PrimitiveTopology, ShaderStage, VertexFormat};
use crate::frame::FenceValue;
use crate::pipeline::{
    BlendComponent, BlendFactor, BlendOp, CompareFunction, CullMode, FillMode, FrontFace, PipelineDesc,
    StencilFace, StencilOp, VertexStepMode,
};
use crate::resource::{
    AddressMode, BufferDesc, BufferUsage, FilterMode, SamplerDesc, ShaderDesc, TextureDesc, TextureRegion,
    TextureUsage, ViewKind,
};

const SAMPLER_BINDING_BASE: u32 = MAX_TEXTURE_SLOTS as u32;
const UNIFORM_BINDING_BASE: u32 = SAMPLER_BINDING_BASE + MAX_SAMPLER_SLOTS as u32;
/// Size of the placeholder bound to unused uniform slots.
const PLACEHOLDER_UNIFORM_SIZE: u64 = 256;

/// Adapter and device selection.
///
/// Features the backend can use (wireframe fill, depth clip control) are
/// enabled when the adapter supports them.
#[derive(Debug, Clone)]
pub struct WgpuInit {
    pub power_preference: wgpu::PowerPreference,

    /// Prefer a software adapter. Useful on CI machines without a GPU.
    pub force_fallback_adapter: bool,

    /// Limits requested from the adapter/device.
    pub required_limits: wgpu::Limits,
}

impl Default for WgpuInit {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_limits: wgpu::Limits::default(),
        }
    }
}

/// Shader module plus the entry point the core asked for.
#[derive(Debug, Clone)]
pub struct WgpuShader {
    module: wgpu::ShaderModule,
    entry_point: String,
    stage: ShaderStage,
}

impl WgpuShader {
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

/// Fence bookkeeping of one logical queue.
#[derive(Debug, Default)]
struct Timeline {
    completed: Arc<AtomicU64>,
    in_flight: Mutex<VecDeque<(u64, wgpu::SubmissionIndex)>>,
}

/// Objects bound to slots nobody filled.
#[derive(Debug)]
struct Placeholders {
    texture_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    uniform: wgpu::Buffer,
}

#[derive(Debug)]
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    placeholders: Placeholders,
    timelines: [Timeline; QueueKind::COUNT],
    lost: Arc<Mutex<Option<String>>>,
    /// Validation errors reported since the last check.
    errors: Arc<Mutex<Vec<String>>>,
    presents: AtomicU64,
}

impl WgpuBackend {
    /// Creates a device without a surface.
    ///
    /// Adapter/device acquisition is asynchronous under wgpu.
    pub async fn new_headless(init: WgpuInit) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: init.power_preference,
                compatible_surface: None,
                force_fallback_adapter: init.force_fallback_adapter,
            })
            .await
            .context("failed to find a suitable GPU adapter")?;

        let optional = wgpu::Features::POLYGON_MODE_LINE | wgpu::Features::DEPTH_CLIP_CONTROL;
        let features = adapter.features() & optional;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("kiln device"),
                required_features: features,
                required_limits: init.required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .context("failed to create wgpu device/queue")?;

        log::info!("wgpu adapter: {:?}", adapter.get_info());
        Ok(Self::from_device(device, queue, features))
    }

    /// Blocking variant of [`WgpuBackend::new_headless`].
    pub fn new_headless_blocking(init: WgpuInit) -> Result<Self> {
        pollster::block_on(Self::new_headless(init))
    }

    /// Wraps an existing device. `features` are the features it was created with.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue, features: wgpu::Features) -> Self {
        let lost = Arc::new(Mutex::new(None));
        device.set_device_lost_callback({
            let lost = Arc::clone(&lost);
            move |reason, message| {
                log::error!("wgpu device lost ({reason:?}): {message}");
                lost.lock().get_or_insert(message);
            }
        });

        let errors = Arc::new(Mutex::new(Vec::new()));
        device.on_uncaptured_error({
            let errors = Arc::clone(&errors);
            Box::new(move |error| {
                log::error!("uncaptured wgpu error: {error}");
                errors.lock().push(error.to_string());
            })
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kiln bind group layout"),
            entries: &layout_entries(),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kiln pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });
        let placeholders = Placeholders::new(&device);

        Self {
            device,
            queue,
            features,
            bind_group_layout,
            pipeline_layout,
            placeholders,
            timelines: Default::default(),
            lost,
            errors,
            presents: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Frames handed to [`Backend::present`].
    pub fn presents(&self) -> u64 {
        self.presents.load(Ordering::Relaxed)
    }

    fn check_alive(&self) -> GpuResult<()> {
        match self.lost.lock().as_ref() {
            Some(reason) => Err(GpuError::device_lost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Turns validation errors raised by the previous call into a creation failure.
    fn take_error(&self, what: &'static str) -> GpuResult<()> {
        match drain_errors(&self.errors) {
            Some(reason) => Err(GpuError::creation(what, reason)),
            None => Ok(()),
        }
    }

    fn poll(&self, poll: wgpu::PollType) -> GpuResult<()> {
        match self.device.poll(poll) {
            Ok(_) => self.check_alive(),
            Err(err) => {
                self.check_alive()?;
                Err(GpuError::Backend(format!("device poll failed: {err}")))
            }
        }
    }

    fn timeline(&self, queue: QueueKind) -> &Timeline {
        &self.timelines[queue.index()]
    }
}

/// Empties the validation error log, joining what it held.
fn drain_errors(errors: &Mutex<Vec<String>>) -> Option<String> {
    let mut errors = errors.lock();
    if errors.is_empty() {
        return None;
    }
    Some(errors.drain(..).collect::<Vec<_>>().join("; "))
}

/// A submission that raised validation errors never ran, so its fence must not be recorded.
fn check_submission(errors: &Mutex<Vec<String>>) -> GpuResult<()> {
    match drain_errors(errors) {
        Some(reason) => Err(GpuError::Backend(format!("submission rejected: {reason}"))),
        None => Ok(()),
    }
}

impl Placeholders {
    fn new(device: &wgpu::Device) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("kiln placeholder texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        Self {
            texture_view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
            sampler: device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("kiln placeholder sampler"),
                ..Default::default()
            }),
            uniform: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kiln placeholder uniform"),
                size: PLACEHOLDER_UNIFORM_SIZE,
                usage: wgpu::BufferUsages::UNIFORM,
                mapped_at_creation: false,
            }),
        }
    }
}

fn uniform_binding(stage: ShaderStage, slot: usize) -> u32 {
    UNIFORM_BINDING_BASE + (stage.index() * MAX_UNIFORM_SLOTS + slot) as u32
}

fn layout_entries() -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(MAX_TEXTURE_SLOTS + MAX_SAMPLER_SLOTS + 2 * MAX_UNIFORM_SLOTS);
    let both = wgpu::ShaderStages::VERTEX_FRAGMENT;
    for i in 0..MAX_TEXTURE_SLOTS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: i,
            visibility: both,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
    }
    for i in 0..MAX_SAMPLER_SLOTS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: SAMPLER_BINDING_BASE + i,
            visibility: both,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    // Per-stage visibility keeps each stage within the default uniform buffer limit.
    for (stage, visibility) in [
        (ShaderStage::Vertex, wgpu::ShaderStages::VERTEX),
        (ShaderStage::Fragment, wgpu::ShaderStages::FRAGMENT),
    ] {
        for slot in 0..MAX_UNIFORM_SLOTS {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: uniform_binding(stage, slot),
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
    }
    entries
}

// ── conversions ───────────────────────────────────────────────────────────

fn texture_format(format: Format) -> GpuResult<wgpu::TextureFormat> {
    Ok(match format {
        Format::Undefined => return Err(GpuError::creation("texture", "undefined format")),
        Format::R8Unorm => wgpu::TextureFormat::R8Unorm,
        Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        Format::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        Format::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        Format::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        Format::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        Format::R32Float => wgpu::TextureFormat::R32Float,
        Format::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        Format::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        Format::Depth32Float => wgpu::TextureFormat::Depth32Float,
    })
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    // Read-back buffers may only be mapped and copied into.
    if usage.contains(BufferUsage::MAP_READ) {
        return wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
    }
    let mut out = wgpu::BufferUsages::empty();
    for (ours, theirs) in [
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, wgpu::BufferUsages::COPY_DST),
        // CPU writes go through `Queue::write_buffer`.
        (BufferUsage::MAP_WRITE, wgpu::BufferUsages::COPY_DST),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn texture_usages(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    for (ours, theirs) in [
        (TextureUsage::SAMPLED, wgpu::TextureUsages::TEXTURE_BINDING),
        (TextureUsage::RENDER_TARGET, wgpu::TextureUsages::RENDER_ATTACHMENT),
        (TextureUsage::DEPTH_STENCIL, wgpu::TextureUsages::RENDER_ATTACHMENT),
        (TextureUsage::COPY_SRC, wgpu::TextureUsages::COPY_SRC),
        (TextureUsage::COPY_DST, wgpu::TextureUsages::COPY_DST),
        (TextureUsage::STORAGE, wgpu::TextureUsages::STORAGE_BINDING),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint16x2 => wgpu::VertexFormat::Uint16x2,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
    }
}

fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

fn topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_component(component: BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: blend_factor(component.src),
        dst_factor: blend_factor(component.dst),
        operation: match component.op {
            BlendOp::Add => wgpu::BlendOperation::Add,
            BlendOp::Subtract => wgpu::BlendOperation::Subtract,
            BlendOp::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOp::Min => wgpu::BlendOperation::Min,
            BlendOp::Max => wgpu::BlendOperation::Max,
        },
    }
}

fn compare(function: CompareFunction) -> wgpu::CompareFunction {
    match function {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn stencil_face(face: &StencilFace) -> wgpu::StencilFaceState {
    let op = |op: StencilOp| match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOp::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOp::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    };
    wgpu::StencilFaceState {
        compare: compare(face.compare),
        fail_op: op(face.fail_op),
        depth_fail_op: op(face.depth_fail_op),
        pass_op: op(face.pass_op),
    }
}

fn filter(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

fn address(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

fn copy_aspect(texture: &wgpu::Texture) -> wgpu::TextureAspect {
    if texture.format().has_depth_aspect() {
        wgpu::TextureAspect::DepthOnly
    } else {
        wgpu::TextureAspect::All
    }
}

fn texel_copy_texture<'t>(texture: &'t wgpu::Texture, region: &TextureRegion) -> wgpu::TexelCopyTextureInfo<'t> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: region.mip_level,
        origin: wgpu::Origin3d {
            x: region.x,
            y: region.y,
            z: region.layer,
        },
        aspect: copy_aspect(texture),
    }
}

fn texel_copy_buffer<'b>(buffer: &'b wgpu::Buffer, layout: &StagingLayout) -> wgpu::TexelCopyBufferInfo<'b> {
    wgpu::TexelCopyBufferInfo {
        buffer,
        layout: wgpu::TexelCopyBufferLayout {
            offset: layout.offset,
            bytes_per_row: Some(layout.bytes_per_row),
            rows_per_image: Some(layout.rows),
        },
    }
}

fn extent(region: &TextureRegion) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: region.width,
        height: region.height,
        depth_or_array_layers: 1,
    }
}

// ── encoding ──────────────────────────────────────────────────────────────

/// Bindings accumulated inside a pass until the next draw.
struct PassBindings<'a> {
    textures: Option<DescriptorTable>,
    samplers: Option<DescriptorTable>,
    uniforms: [[Option<(&'a wgpu::Buffer, u64, u64)>; MAX_UNIFORM_SLOTS]; ShaderStage::COUNT],
    dirty: bool,
}

impl<'a> PassBindings<'a> {
    fn new() -> Self {
        Self {
            textures: None,
            samplers: None,
            uniforms: [[None; MAX_UNIFORM_SLOTS]; ShaderStage::COUNT],
            dirty: true,
        }
    }

    fn bind_group(&self, backend: &WgpuBackend, tables: Option<&FrameTables<'a, WgpuBackend>>) -> wgpu::BindGroup {
        let textures = match (tables, self.textures) {
            (Some(tables), Some(table)) => tables.textures.entries(table),
            _ => &[],
        };
        let samplers = match (tables, self.samplers) {
            (Some(tables), Some(table)) => tables.samplers.entries(table),
            _ => &[],
        };

        let mut entries = Vec::with_capacity(MAX_TEXTURE_SLOTS + MAX_SAMPLER_SLOTS + 2 * MAX_UNIFORM_SLOTS);
        for i in 0..MAX_TEXTURE_SLOTS {
            let view = textures
                .get(i)
                .and_then(Option::as_ref)
                .unwrap_or(&backend.placeholders.texture_view);
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        for i in 0..MAX_SAMPLER_SLOTS {
            let sampler = samplers
                .get(i)
                .and_then(Option::as_ref)
                .unwrap_or(&backend.placeholders.sampler);
            entries.push(wgpu::BindGroupEntry {
                binding: SAMPLER_BINDING_BASE + i as u32,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            for (slot, binding) in self.uniforms[stage.index()].iter().enumerate() {
                let (buffer, offset, size) =
                    binding.unwrap_or((&backend.placeholders.uniform, 0, PLACEHOLDER_UNIFORM_SIZE));
                entries.push(wgpu::BindGroupEntry {
                    binding: uniform_binding(stage, slot),
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer,
                        offset,
                        size: NonZeroU64::new(size),
                    }),
                });
            }
        }

        backend.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kiln draw bindings"),
            layout: &backend.bind_group_layout,
            entries: &entries,
        })
    }
}

/// Encodes commands up to the matching `EndPass` into one render pass.
fn encode_pass<'a>(
    backend: &WgpuBackend,
    encoder: &mut wgpu::CommandEncoder,
    colors: &[ColorAttachment<WgpuBackend>],
    depth: Option<&DepthAttachment<WgpuBackend>>,
    commands: &mut std::slice::Iter<'a, Command<WgpuBackend>>,
    tables: Option<&FrameTables<'a, WgpuBackend>>,
) -> GpuResult<()> {
    let color_attachments: Vec<_> = colors
        .iter()
        .map(|color| {
            Some(wgpu::RenderPassColorAttachment {
                view: &color.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: match color.clear {
                        Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        None => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })
        })
        .collect();
    let depth_stencil_attachment = depth.map(|depth| wgpu::RenderPassDepthStencilAttachment {
        view: &depth.view,
        depth_ops: Some(wgpu::Operations {
            load: depth.clear_depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
            store: wgpu::StoreOp::Store,
        }),
        stencil_ops: depth.has_stencil.then(|| wgpu::Operations {
            load: depth.clear_stencil.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
            store: wgpu::StoreOp::Store,
        }),
    });

    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("kiln pass"),
        color_attachments: &color_attachments,
        depth_stencil_attachment,
        timestamp_writes: None,
        occlusion_query_set: None,
        multiview_mask: None,
    });

    let mut bindings = PassBindings::new();
    for command in commands.by_ref() {
        match command {
            Command::EndPass => return Ok(()),
            Command::SetPipeline(pipeline) => pass.set_pipeline(pipeline),
            Command::SetVertexBuffer { slot, buffer, offset } => {
                pass.set_vertex_buffer(*slot, buffer.slice(*offset..));
            }
            Command::SetIndexBuffer { buffer, offset, format } => {
                pass.set_index_buffer(buffer.slice(*offset..), index_format(*format));
            }
            Command::SetUniform {
                stage,
                slot,
                buffer,
                offset,
                size,
            } => {
                if let Some(entry) = bindings.uniforms[stage.index()].get_mut(*slot as usize) {
                    *entry = Some((buffer, *offset, *size));
                    bindings.dirty = true;
                }
            }
            Command::BindTextures(table) => {
                bindings.textures = Some(*table);
                bindings.dirty = true;
            }
            Command::BindSamplers(table) => {
                bindings.samplers = Some(*table);
                bindings.dirty = true;
            }
            Command::SetViewport(Viewport {
                x,
                y,
                width,
                height,
                min_depth,
                max_depth,
            }) => pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth),
            Command::SetScissor(ScissorRect { x, y, width, height }) => {
                pass.set_scissor_rect(*x, *y, *width, *height);
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                if bindings.dirty {
                    pass.set_bind_group(0, &bindings.bind_group(backend, tables), &[]);
                    bindings.dirty = false;
                }
                pass.draw(
                    *first_vertex..first_vertex + vertex_count,
                    *first_instance..first_instance + instance_count,
                );
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            } => {
                if bindings.dirty {
                    pass.set_bind_group(0, &bindings.bind_group(backend, tables), &[]);
                    bindings.dirty = false;
                }
                pass.draw_indexed(
                    *first_index..first_index + index_count,
                    *base_vertex,
                    *first_instance..first_instance + instance_count,
                );
            }
            Command::Barriers(_) => {}
            Command::BeginPass { .. }
            | Command::CopyBuffer { .. }
            | Command::CopyBufferToTexture { .. }
            | Command::CopyTextureToBuffer { .. } => {
                return Err(GpuError::Backend(format!("{command:?} recorded inside a render pass")));
            }
        }
    }
    Err(GpuError::Backend("render pass was never ended".into()))
}

impl Backend for WgpuBackend {
    type Buffer = wgpu::Buffer;
    type Texture = wgpu::Texture;
    type TextureView = wgpu::TextureView;
    type Sampler = wgpu::Sampler;
    type Shader = WgpuShader;
    type Pipeline = wgpu::RenderPipeline;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<wgpu::Buffer> {
        self.check_alive()?;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        self.take_error("buffer")?;
        Ok(buffer)
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<wgpu::Texture> {
        self.check_alive()?;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(desc.format)?,
            usage: texture_usages(desc.usage),
            view_formats: &[],
        });
        self.take_error("texture")?;
        Ok(texture)
    }

    fn create_view(&self, texture: &wgpu::Texture, desc: &TextureDesc, kind: ViewKind) -> GpuResult<wgpu::TextureView> {
        let view = match kind {
            // The shared layout declares 2D slots, so arrays are sampled through layer 0.
            ViewKind::ShaderResource => texture.create_view(&wgpu::TextureViewDescriptor {
                label: desc.label.as_deref(),
                dimension: Some(wgpu::TextureViewDimension::D2),
                array_layer_count: Some(1),
                aspect: if desc.format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
                ..Default::default()
            }),
            ViewKind::RenderTarget | ViewKind::DepthStencil => texture.create_view(&wgpu::TextureViewDescriptor {
                label: desc.label.as_deref(),
                dimension: Some(wgpu::TextureViewDimension::D2),
                mip_level_count: Some(1),
                array_layer_count: Some(1),
                ..Default::default()
            }),
        };
        self.take_error("texture view")?;
        Ok(view)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> GpuResult<wgpu::Sampler> {
        if desc.compare.is_some() {
            // Sampler slots are laid out as filtering samplers.
            return Err(GpuError::creation("sampler", "comparison samplers are not supported"));
        }
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("kiln sampler"),
            address_mode_u: address(desc.address_u),
            address_mode_v: address(desc.address_v),
            address_mode_w: address(desc.address_w),
            mag_filter: filter(desc.mag_filter),
            min_filter: filter(desc.min_filter),
            mipmap_filter: match desc.mip_filter {
                FilterMode::Nearest => wgpu::MipmapFilterMode::Nearest,
                FilterMode::Linear => wgpu::MipmapFilterMode::Linear,
            },
            lod_min_clamp: desc.lod_min_clamp,
            lod_max_clamp: desc.lod_max_clamp,
            anisotropy_clamp: desc.max_anisotropy.max(1),
            ..Default::default()
        });
        self.take_error("sampler")?;
        Ok(sampler)
    }

    /// Bytecode is WGSL source text.
    fn create_shader(&self, desc: &ShaderDesc) -> GpuResult<WgpuShader> {
        self.check_alive()?;
        let source = std::str::from_utf8(&desc.bytecode)
            .map_err(|err| GpuError::creation("shader", format!("source is not UTF-8: {err}")))?;
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: desc.label.as_deref(),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });
        self.take_error("shader")?;
        Ok(WgpuShader {
            module,
            entry_point: desc.entry_point.clone(),
            stage: desc.stage,
        })
    }

    fn destroy_buffer(&self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }

    fn destroy_texture(&self, texture: wgpu::Texture) {
        texture.destroy();
    }

    fn build_pipeline(
        &self,
        desc: &PipelineDesc,
        vertex: &WgpuShader,
        fragment: Option<&WgpuShader>,
    ) -> GpuResult<wgpu::RenderPipeline> {
        self.check_alive()?;

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = (0..desc.layout.buffers().len())
            .map(|slot| {
                desc.layout
                    .attributes()
                    .iter()
                    .filter(|a| usize::from(a.slot) == slot)
                    .map(|a| wgpu::VertexAttribute {
                        format: vertex_format(a.format),
                        offset: u64::from(a.offset),
                        shader_location: u32::from(a.location),
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<_> = desc
            .layout
            .buffers()
            .iter()
            .zip(&attributes)
            .map(|(buffer, attributes)| wgpu::VertexBufferLayout {
                array_stride: u64::from(buffer.stride),
                step_mode: match buffer.step {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes,
            })
            .collect();

        let blend = &desc.blend;
        let targets = desc
            .color_formats
            .iter()
            .map(|&format| {
                Ok(Some(wgpu::ColorTargetState {
                    format: texture_format(format)?,
                    blend: blend.enabled.then(|| wgpu::BlendState {
                        color: blend_component(blend.color),
                        alpha: blend_component(blend.alpha),
                    }),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(u32::from(blend.write_mask.bits())),
                }))
            })
            .collect::<GpuResult<Vec<_>>>()?;

        let ds = &desc.depth_stencil;
        let raster = &desc.raster;
        let depth_stencil = match desc.depth_format {
            Some(format) => Some(wgpu::DepthStencilState {
                format: texture_format(format)?,
                depth_write_enabled: ds.depth_test && ds.depth_write,
                depth_compare: if ds.depth_test {
                    compare(ds.depth_compare)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: if ds.stencil_enabled {
                    wgpu::StencilState {
                        front: stencil_face(&ds.front),
                        back: stencil_face(&ds.back),
                        read_mask: u32::from(ds.stencil_read_mask),
                        write_mask: u32::from(ds.stencil_write_mask),
                    }
                } else {
                    wgpu::StencilState::default()
                },
                bias: wgpu::DepthBiasState {
                    constant: raster.depth_bias,
                    slope_scale: raster.depth_bias_slope_scale,
                    clamp: 0.0,
                },
            }),
            None => None,
        };

        let polygon_mode = match raster.fill_mode {
            FillMode::Wireframe if self.features.contains(wgpu::Features::POLYGON_MODE_LINE) => {
                wgpu::PolygonMode::Line
            }
            FillMode::Wireframe => {
                log::warn!("wireframe fill unsupported by the adapter; drawing solid");
                wgpu::PolygonMode::Fill
            }
            FillMode::Solid => wgpu::PolygonMode::Fill,
        };

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("kiln pipeline"),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex.module,
                entry_point: Some(vertex.entry_point.as_str()),
                compilation_options: Default::default(),
                buffers: &buffers,
            },
            fragment: fragment.map(|fs| wgpu::FragmentState {
                module: &fs.module,
                entry_point: Some(fs.entry_point.as_str()),
                compilation_options: Default::default(),
                targets: &targets,
            }),
            primitive: wgpu::PrimitiveState {
                topology: topology(desc.topology),
                strip_index_format: None,
                front_face: match raster.front_face {
                    FrontFace::Ccw => wgpu::FrontFace::Ccw,
                    FrontFace::Cw => wgpu::FrontFace::Cw,
                },
                cull_mode: match raster.cull_mode {
                    CullMode::None => None,
                    CullMode::Front => Some(wgpu::Face::Front),
                    CullMode::Back => Some(wgpu::Face::Back),
                },
                polygon_mode,
                unclipped_depth: !raster.depth_clip && self.features.contains(wgpu::Features::DEPTH_CLIP_CONTROL),
                conservative: false,
            },
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: desc.sample_count.max(1),
                ..Default::default()
            },
            multiview_mask: None,
            cache: None,
        });
        self.take_error("pipeline")?;
        Ok(pipeline)
    }

    /// Offset and padded length must stay 4-byte aligned; a short tail is
    /// zero-padded up to the alignment.
    fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.check_alive()?;
        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        let padded = (data.len() as u64).next_multiple_of(align);
        if offset % align != 0 || offset + padded > buffer.size() {
            return Err(GpuError::Backend(format!(
                "unaligned or out-of-bounds write of {} bytes at {offset}",
                data.len()
            )));
        }
        if padded == data.len() as u64 {
            self.queue.write_buffer(buffer, offset, data);
        } else {
            let mut bytes = data.to_vec();
            bytes.resize(padded as usize, 0);
            self.queue.write_buffer(buffer, offset, &bytes);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &wgpu::Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        self.check_alive()?;
        let start = offset - offset % wgpu::MAP_ALIGNMENT;
        let end = (offset + len)
            .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
            .min(buffer.size());
        if offset + len > end {
            return Err(GpuError::Backend(format!("read of {len} bytes at {offset} past the buffer end")));
        }

        let slice = buffer.slice(start..end);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            drop(sender.send(res));
        });
        self.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })?;
        match receiver.try_recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(GpuError::Backend(format!("buffer map failed: {err}"))),
            Err(_) => return Err(GpuError::Backend("buffer map did not complete".into())),
        }

        let skip = (offset - start) as usize;
        let data = slice.get_mapped_range()[skip..skip + len as usize].to_vec();
        buffer.unmap();
        Ok(data)
    }

    fn submit(&self, submission: Submission<'_, Self>) -> GpuResult<()> {
        self.check_alive()?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kiln command list"),
        });

        let tables = submission.tables.as_ref();
        let mut commands = submission.commands.iter();
        while let Some(command) = commands.next() {
            match command {
                Command::Barriers(_) => {}
                Command::BeginPass { colors, depth } => {
                    encode_pass(self, &mut encoder, colors, depth.as_ref(), &mut commands, tables)?;
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => encoder.copy_buffer_to_buffer(src, *src_offset, dst, *dst_offset, *size),
                Command::CopyBufferToTexture { src, layout, dst, region } => encoder.copy_buffer_to_texture(
                    texel_copy_buffer(src, layout),
                    texel_copy_texture(dst, region),
                    extent(region),
                ),
                Command::CopyTextureToBuffer { src, region, dst, layout } => encoder.copy_texture_to_buffer(
                    texel_copy_texture(src, region),
                    texel_copy_buffer(dst, layout),
                    extent(region),
                ),
                other => {
                    return Err(GpuError::Backend(format!("{other:?} recorded outside a render pass")));
                }
            }
        }

        let index = self.queue.submit([encoder.finish()]);
        check_submission(&self.errors)?;

        let timeline = self.timeline(submission.queue);
        let signal = submission.signal.get();
        timeline.in_flight.lock().push_back((signal, index));
        let completed = Arc::clone(&timeline.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(signal, Ordering::AcqRel);
        });
        Ok(())
    }

    fn completed_fence(&self, queue: QueueKind) -> GpuResult<FenceValue> {
        self.poll(wgpu::PollType::Poll)?;
        Ok(FenceValue::new(self.timeline(queue).completed.load(Ordering::Acquire)))
    }

    fn wait_fence(&self, queue: QueueKind, value: FenceValue) -> GpuResult<()> {
        let timeline = self.timeline(queue);
        if timeline.completed.load(Ordering::Acquire) >= value.get() {
            return Ok(());
        }
        let index = {
            let mut in_flight = timeline.in_flight.lock();
            let mut index = None;
            while in_flight.front().is_some_and(|(signal, _)| *signal <= value.get()) {
                index = in_flight.pop_front().map(|(_, index)| index);
            }
            index
        };
        self.poll(wgpu::PollType::Wait {
            submission_index: index,
            timeout: None,
        })?;
        timeline.completed.fetch_max(value.get(), Ordering::AcqRel);
        Ok(())
    }

    /// The single wgpu queue already executes submissions in order.
    fn queue_wait(&self, queue: QueueKind, on: QueueKind, value: FenceValue) -> GpuResult<()> {
        log::trace!("{queue:?} waits on {on:?} fence {} (implicit)", value.get());
        self.check_alive()
    }

    fn present(&self, _image: &wgpu::Texture, _sync_interval: u32) -> GpuResult<()> {
        self.check_alive()?;
        self.presents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_bindings_follow_the_sampler_range() {
        assert_eq!(uniform_binding(ShaderStage::Vertex, 0), 32);
        assert_eq!(uniform_binding(ShaderStage::Vertex, 7), 39);
        assert_eq!(uniform_binding(ShaderStage::Fragment, 0), 40);
        assert_eq!(layout_entries().len(), 48);
    }

    #[test]
    fn upload_memory_becomes_a_copy_destination() {
        let usages = buffer_usages(BufferUsage::VERTEX | BufferUsage::MAP_WRITE);
        assert_eq!(usages, wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST);
    }

    #[test]
    fn read_back_memory_drops_other_usages() {
        let usages = buffer_usages(BufferUsage::COPY_DST | BufferUsage::MAP_READ | BufferUsage::UNIFORM);
        assert_eq!(usages, wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST);
    }

    #[test]
    fn depth_and_render_target_usages_share_the_attachment_bit() {
        assert_eq!(
            texture_usages(TextureUsage::DEPTH_STENCIL | TextureUsage::RENDER_TARGET),
            wgpu::TextureUsages::RENDER_ATTACHMENT
        );
        assert_eq!(
            texture_usages(TextureUsage::SAMPLED | TextureUsage::COPY_DST),
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST
        );
    }

    #[test]
    fn rejected_submission_surfaces_every_error() {
        let errors = Mutex::new(vec!["copy out of bounds".to_string(), "buffer missing COPY_SRC".to_string()]);
        let err = check_submission(&errors).unwrap_err();
        assert_eq!(
            err,
            GpuError::Backend("submission rejected: copy out of bounds; buffer missing COPY_SRC".into())
        );
        assert!(errors.lock().is_empty());
        assert_eq!(check_submission(&errors), Ok(()));
    }

    #[test]
    fn undefined_format_is_rejected() {
        assert!(texture_format(Format::Undefined).is_err());
        assert_eq!(
            texture_format(Format::Depth24PlusStencil8),
            Ok(wgpu::TextureFormat::Depth24PlusStencil8)
        );
    }
}
