//! Fixed-function state, vertex layouts and pipeline keys.
//!
//! Typed state objects are what callers build. Before hashing, each is packed
//! into a `repr(C)` plain-old-data key whose padding is spelled out as explicit
//! fields and zeroed, so two logically identical states always produce the
//! same bytes.

mod cache;
mod state_cache;

pub use cache::{CacheStats, PipelineCache};
pub use state_cache::StateCache;

use std::sync::Arc;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::{GpuError, GpuResult};
use crate::format::{Format, PrimitiveTopology, VertexFormat};
use crate::handle::{shader_key, ShaderId};

pub const MAX_VERTEX_ATTRIBUTES: usize = 8;
pub const MAX_VERTEX_BUFFERS: usize = 4;
pub const MAX_COLOR_TARGETS: usize = 4;

/// A state that can be packed into a hashable, padding-free key.
pub trait PackedState {
    type Key: Pod;

    fn pack(&self) -> Self::Key;
}

/// 64-bit hash of a packed key.
#[inline]
pub fn hash_key<K: Pod>(key: &K) -> u64 {
    xxhash_rust::xxh64::xxh64(bytemuck::bytes_of(key), 0)
}

// ── blend ─────────────────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BlendFactor {
    Zero = 0,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum BlendOp {
    #[default]
    Add = 0,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlendComponent {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
}

impl BlendComponent {
    pub const REPLACE: Self = Self {
        src: BlendFactor::One,
        dst: BlendFactor::Zero,
        op: BlendOp::Add,
    };

    pub const OVER: Self = Self {
        src: BlendFactor::SrcAlpha,
        dst: BlendFactor::OneMinusSrcAlpha,
        op: BlendOp::Add,
    };
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ColorWrites: u8 {
        const RED   = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE  = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL   = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub color: BlendComponent,
    pub alpha: BlendComponent,
    pub write_mask: ColorWrites,
}

impl BlendState {
    pub const OPAQUE: Self = Self {
        enabled: false,
        color: BlendComponent::REPLACE,
        alpha: BlendComponent::REPLACE,
        write_mask: ColorWrites::ALL,
    };

    pub const ALPHA_BLENDING: Self = Self {
        enabled: true,
        color: BlendComponent::OVER,
        alpha: BlendComponent::OVER,
        write_mask: ColorWrites::ALL,
    };
}

impl Default for BlendState {
    fn default() -> Self {
        Self::OPAQUE
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct BlendKey {
    pub enabled: u8,
    pub color_src: u8,
    pub color_dst: u8,
    pub color_op: u8,
    pub alpha_src: u8,
    pub alpha_dst: u8,
    pub alpha_op: u8,
    pub write_mask: u8,
}

impl PackedState for BlendState {
    type Key = BlendKey;

    fn pack(&self) -> BlendKey {
        BlendKey {
            enabled: self.enabled as u8,
            color_src: self.color.src as u8,
            color_dst: self.color.dst as u8,
            color_op: self.color.op as u8,
            alpha_src: self.alpha.src as u8,
            alpha_dst: self.alpha.dst as u8,
            alpha_op: self.alpha.op as u8,
            write_mask: self.write_mask.bits(),
        }
    }
}

// ── depth / stencil ───────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CompareFunction {
    Never = 0,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum StencilOp {
    #[default]
    Keep = 0,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct StencilFace {
    pub compare: CompareFunction,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
}

impl StencilFace {
    pub const IGNORE: Self = Self {
        compare: CompareFunction::Always,
        fail_op: StencilOp::Keep,
        depth_fail_op: StencilOp::Keep,
        pass_op: StencilOp::Keep,
    };
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    pub stencil_enabled: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl DepthStencilState {
    pub const DISABLED: Self = Self {
        depth_test: false,
        depth_write: false,
        depth_compare: CompareFunction::Always,
        stencil_enabled: false,
        stencil_read_mask: 0xFF,
        stencil_write_mask: 0xFF,
        front: StencilFace::IGNORE,
        back: StencilFace::IGNORE,
    };

    pub const LESS_WRITE: Self = Self {
        depth_test: true,
        depth_write: true,
        depth_compare: CompareFunction::Less,
        ..Self::DISABLED
    };
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self::LESS_WRITE
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct StencilFaceKey {
    pub compare: u8,
    pub fail_op: u8,
    pub depth_fail_op: u8,
    pub pass_op: u8,
}

impl StencilFaceKey {
    fn pack(face: &StencilFace) -> Self {
        Self {
            compare: face.compare as u8,
            fail_op: face.fail_op as u8,
            depth_fail_op: face.depth_fail_op as u8,
            pass_op: face.pass_op as u8,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct DepthStencilKey {
    pub depth_test: u8,
    pub depth_write: u8,
    pub depth_compare: u8,
    pub stencil_enabled: u8,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFaceKey,
    pub back: StencilFaceKey,
    pub _pad: [u8; 2],
}

impl PackedState for DepthStencilState {
    type Key = DepthStencilKey;

    fn pack(&self) -> DepthStencilKey {
        DepthStencilKey {
            depth_test: self.depth_test as u8,
            depth_write: self.depth_write as u8,
            depth_compare: self.depth_compare as u8,
            stencil_enabled: self.stencil_enabled as u8,
            stencil_read_mask: self.stencil_read_mask,
            stencil_write_mask: self.stencil_write_mask,
            front: StencilFaceKey::pack(&self.front),
            back: StencilFaceKey::pack(&self.back),
            _pad: [0; 2],
        }
    }
}

// ── raster ────────────────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum CullMode {
    None = 0,
    Front,
    #[default]
    Back,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum FillMode {
    #[default]
    Solid = 0,
    Wireframe,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum FrontFace {
    #[default]
    Ccw = 0,
    Cw,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub fill_mode: FillMode,
    pub front_face: FrontFace,
    pub scissor_test: bool,
    pub depth_bias: i32,
    pub depth_bias_slope_scale: f32,
    pub depth_clip: bool,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            fill_mode: FillMode::Solid,
            front_face: FrontFace::Ccw,
            scissor_test: false,
            depth_bias: 0,
            depth_bias_slope_scale: 0.0,
            depth_clip: true,
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct RasterKey {
    pub cull_mode: u8,
    pub fill_mode: u8,
    pub front_face: u8,
    pub scissor_test: u8,
    pub depth_bias: i32,
    pub depth_bias_slope_scale: u32,
    pub depth_clip: u8,
    pub _pad: [u8; 3],
}

impl PackedState for RasterState {
    type Key = RasterKey;

    fn pack(&self) -> RasterKey {
        // -0.0 and 0.0 are the same bias.
        let slope = if self.depth_bias_slope_scale == 0.0 {
            0
        } else {
            self.depth_bias_slope_scale.to_bits()
        };
        RasterKey {
            cull_mode: self.cull_mode as u8,
            fill_mode: self.fill_mode as u8,
            front_face: self.front_face as u8,
            scissor_test: self.scissor_test as u8,
            depth_bias: self.depth_bias,
            depth_bias_slope_scale: slope,
            depth_clip: self.depth_clip as u8,
            _pad: [0; 3],
        }
    }
}

// ── vertex input ──────────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum VertexStepMode {
    #[default]
    Vertex = 0,
    Instance,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u8,
    /// Vertex buffer slot the attribute is read from.
    pub slot: u8,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub step: VertexStepMode,
}

/// Vertex input layout ("input layout" in the device API).
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
///
/// Only [`VertexLayout::new`] builds one, so a layout always fits its packed key.
pub struct VertexLayout {
    attributes: Vec<VertexAttribute>,
    buffers: Vec<VertexBufferLayout>,
}

impl VertexLayout {
    pub fn new(attributes: Vec<VertexAttribute>, buffers: Vec<VertexBufferLayout>) -> GpuResult<Self> {
        if attributes.len() > MAX_VERTEX_ATTRIBUTES {
            return Err(GpuError::InvalidConfig(format!(
                "{} vertex attributes, at most {MAX_VERTEX_ATTRIBUTES} supported",
                attributes.len()
            )));
        }
        if buffers.len() > MAX_VERTEX_BUFFERS {
            return Err(GpuError::InvalidConfig(format!(
                "{} vertex buffers, at most {MAX_VERTEX_BUFFERS} supported",
                buffers.len()
            )));
        }
        if let Some(attr) = attributes.iter().find(|a| usize::from(a.slot) >= buffers.len()) {
            return Err(GpuError::InvalidConfig(format!(
                "attribute at location {} reads unbound vertex slot {}",
                attr.location, attr.slot
            )));
        }
        Ok(Self { attributes, buffers })
    }

    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.attributes
    }

    pub fn buffers(&self) -> &[VertexBufferLayout] {
        &self.buffers
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VertexAttributeKey {
    pub format: u8,
    pub slot: u8,
    pub location: u8,
    pub _pad: u8,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct VertexLayoutKey {
    pub attributes: [VertexAttributeKey; MAX_VERTEX_ATTRIBUTES],
    pub strides: [u32; MAX_VERTEX_BUFFERS],
    pub step_modes: [u8; MAX_VERTEX_BUFFERS],
    pub attribute_count: u8,
    pub buffer_count: u8,
    pub _pad: [u8; 2],
}

impl PackedState for VertexLayout {
    type Key = VertexLayoutKey;

    fn pack(&self) -> VertexLayoutKey {
        let mut key = VertexLayoutKey::zeroed();
        for (dst, attr) in key.attributes.iter_mut().zip(&self.attributes) {
            *dst = VertexAttributeKey {
                format: attr.format as u8,
                slot: attr.slot,
                location: attr.location,
                _pad: 0,
                offset: attr.offset,
            };
        }
        for (i, buffer) in self.buffers.iter().take(MAX_VERTEX_BUFFERS).enumerate() {
            key.strides[i] = buffer.stride;
            key.step_modes[i] = buffer.step as u8;
        }
        key.attribute_count = self.attributes.len().min(MAX_VERTEX_ATTRIBUTES) as u8;
        key.buffer_count = self.buffers.len().min(MAX_VERTEX_BUFFERS) as u8;
        key
    }
}

// ── pipeline ──────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct TargetKey {
    pub color_formats: [u8; MAX_COLOR_TARGETS],
    pub depth_format: u8,
    pub sample_count: u8,
    pub topology: u8,
    pub color_count: u8,
}

/// Packed aggregate pipeline state. The pipeline cache key.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct PipelineKey {
    pub vertex_shader: u64,
    /// Zero when there is no fragment stage.
    pub fragment_shader: u64,
    pub blend: BlendKey,
    pub depth_stencil: DepthStencilKey,
    pub raster: RasterKey,
    pub vertex: VertexLayoutKey,
    pub targets: TargetKey,
}

impl PipelineKey {
    /// Zeroes every byte that does not carry state: explicit padding and
    /// array entries past their counts.
    pub fn normalized(mut self) -> Self {
        self.depth_stencil._pad = [0; 2];
        self.raster._pad = [0; 3];

        let vertex = &mut self.vertex;
        vertex._pad = [0; 2];
        vertex.attribute_count = vertex.attribute_count.min(MAX_VERTEX_ATTRIBUTES as u8);
        vertex.buffer_count = vertex.buffer_count.min(MAX_VERTEX_BUFFERS as u8);
        let live_attributes = usize::from(vertex.attribute_count);
        for (i, attr) in vertex.attributes.iter_mut().enumerate() {
            if i < live_attributes {
                attr._pad = 0;
            } else {
                *attr = VertexAttributeKey::zeroed();
            }
        }
        for i in usize::from(vertex.buffer_count)..MAX_VERTEX_BUFFERS {
            vertex.strides[i] = 0;
            vertex.step_modes[i] = 0;
        }

        let targets = &mut self.targets;
        targets.color_count = targets.color_count.min(MAX_COLOR_TARGETS as u8);
        let live_targets = usize::from(targets.color_count);
        for format in &mut targets.color_formats[live_targets..] {
            *format = 0;
        }
        self
    }

    pub fn hash(&self) -> u64 {
        hash_key(&self.normalized())
    }
}

/// Everything a native pipeline object is built from.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub vertex_shader: ShaderId,
    pub fragment_shader: Option<ShaderId>,
    pub blend: Arc<BlendState>,
    pub depth_stencil: Arc<DepthStencilState>,
    pub raster: Arc<RasterState>,
    pub layout: Arc<VertexLayout>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub sample_count: u32,
    pub topology: PrimitiveTopology,
}

impl PipelineDesc {
    pub fn key(&self) -> PipelineKey {
        let mut targets = TargetKey::zeroed();
        for (dst, format) in targets.color_formats.iter_mut().zip(&self.color_formats) {
            *dst = *format as u8;
        }
        targets.color_count = self.color_formats.len().min(MAX_COLOR_TARGETS) as u8;
        targets.depth_format = self.depth_format.map_or(0, |f| f as u8);
        targets.sample_count = self.sample_count as u8;
        targets.topology = self.topology as u8;

        PipelineKey {
            vertex_shader: shader_key(self.vertex_shader),
            fragment_shader: self.fragment_shader.map_or(0, shader_key),
            blend: self.blend.pack(),
            depth_stencil: self.depth_stencil.pack(),
            raster: self.raster.pack(),
            vertex: self.layout.pack(),
            targets,
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> VertexLayout {
        VertexLayout::new(
            vec![
                VertexAttribute { location: 0, slot: 0, format: VertexFormat::Float32x3, offset: 0 },
                VertexAttribute { location: 1, slot: 0, format: VertexFormat::Float32x2, offset: 12 },
            ],
            vec![VertexBufferLayout { stride: 20, step: VertexStepMode::Vertex }],
        )
        .unwrap()
    }

    // ── packing ───────────────────────────────────────────────────────────

    #[test]
    fn key_has_no_implicit_padding() {
        assert_eq!(size_of::<BlendKey>(), 8);
        assert_eq!(size_of::<DepthStencilKey>(), 16);
        assert_eq!(size_of::<RasterKey>(), 16);
        assert_eq!(size_of::<VertexLayoutKey>(), 88);
        assert_eq!(size_of::<PipelineKey>(), 152);
    }

    #[test]
    fn signed_zero_bias_packs_identically() {
        let a = RasterState { depth_bias_slope_scale: 0.0, ..Default::default() };
        let b = RasterState { depth_bias_slope_scale: -0.0, ..Default::default() };
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn distinct_states_pack_differently() {
        assert_ne!(BlendState::OPAQUE.pack(), BlendState::ALPHA_BLENDING.pack());
        assert_ne!(DepthStencilState::DISABLED.pack(), DepthStencilState::LESS_WRITE.pack());
    }

    // ── normalization ─────────────────────────────────────────────────────

    #[test]
    fn padding_bytes_do_not_change_hash() {
        let mut clean = PipelineKey::zeroed();
        clean.vertex = layout().pack();
        clean.targets.color_count = 1;

        let mut dirty = clean;
        dirty.depth_stencil._pad = [0xAB, 0xCD];
        dirty.raster._pad = [1, 2, 3];
        dirty.vertex._pad = [9, 9];
        dirty.vertex.attributes[0]._pad = 0x5A;
        dirty.vertex.attributes[5].offset = 1234;
        dirty.vertex.strides[3] = 64;
        dirty.targets.color_formats[2] = Format::Rgba8Unorm as u8;

        assert_ne!(bytemuck::bytes_of(&clean), bytemuck::bytes_of(&dirty));
        assert_eq!(clean.hash(), dirty.hash());
        assert_eq!(clean.normalized(), dirty.normalized());
    }

    #[test]
    fn normalization_keeps_live_fields() {
        let packed = layout().pack();
        let mut key = PipelineKey::zeroed();
        key.vertex = packed;
        assert_eq!(key.normalized().vertex, packed);
    }

    // ── layouts ───────────────────────────────────────────────────────────

    #[test]
    fn layout_rejects_unbound_slot() {
        let err = VertexLayout::new(
            vec![VertexAttribute { location: 0, slot: 1, format: VertexFormat::Float32, offset: 0 }],
            vec![VertexBufferLayout { stride: 4, step: VertexStepMode::Vertex }],
        );
        assert!(matches!(err, Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn layout_rejects_too_many_attributes() {
        let attributes = (0..9)
            .map(|i| VertexAttribute { location: i, slot: 0, format: VertexFormat::Float32, offset: u32::from(i) * 4 })
            .collect();
        let buffers = vec![VertexBufferLayout { stride: 36, step: VertexStepMode::Vertex }];
        assert!(VertexLayout::new(attributes, buffers).is_err());
    }
}
