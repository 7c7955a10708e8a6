use bitflags::bitflags;

use crate::backend::Backend;
use crate::descriptor::DescriptorHandle;
use crate::format::Format;
use crate::frame::FrameCounter;

use super::{queue_transition, BarrierBatch, ResourceRef, ResourceState};

bitflags! {
    #[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED       = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_STENCIL = 1 << 2;
        const COPY_SRC      = 1 << 3;
        const COPY_DST      = 1 << 4;
        const STORAGE       = 1 << 5;
    }
}

/// Which descriptor heap a texture view lives in.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ViewKind {
    ShaderResource,
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: Format,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            format,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A rectangle of one mip level of one array layer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
    pub mip_level: u32,
    pub width: u32,
    pub height: u32,
}

impl TextureRegion {
    /// The whole of mip 0, layer 0.
    pub fn full(desc: &TextureDesc) -> Self {
        Self {
            x: 0,
            y: 0,
            layer: 0,
            mip_level: 0,
            width: desc.width,
            height: desc.height,
        }
    }

    /// Whether the region lies inside the texture.
    pub fn fits(&self, desc: &TextureDesc) -> bool {
        let mip_w = (desc.width >> self.mip_level).max(1);
        let mip_h = (desc.height >> self.mip_level).max(1);
        self.mip_level < desc.mip_levels
            && self.layer < desc.array_layers
            && self.width > 0
            && self.height > 0
            && self.x.checked_add(self.width).is_some_and(|r| r <= mip_w)
            && self.y.checked_add(self.height).is_some_and(|b| b <= mip_h)
    }
}

/// Descriptor slots claimed by a texture's cached views.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TextureViews {
    pub shader: Option<DescriptorHandle>,
    pub render: Option<DescriptorHandle>,
    pub depth: Option<DescriptorHandle>,
}

/// A texture as owned by the device.
#[derive(Debug)]
pub struct Texture<B: Backend> {
    native: B::Texture,
    desc: TextureDesc,
    state: ResourceState,
    last_used: FrameCounter,
    is_display: bool,
    pub(crate) views: TextureViews,
}

impl<B: Backend> Texture<B> {
    pub(crate) fn new(
        native: B::Texture,
        desc: TextureDesc,
        is_display: bool,
        views: TextureViews,
        frame: FrameCounter,
    ) -> Self {
        Self {
            native,
            desc,
            state: ResourceState::Initial,
            last_used: frame,
            is_display,
            views,
        }
    }

    #[inline]
    pub fn native(&self) -> &B::Texture {
        &self.native
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Whether this is one of the display (swapchain) images.
    #[inline]
    pub fn is_display(&self) -> bool {
        self.is_display
    }

    #[inline]
    pub fn last_used(&self) -> FrameCounter {
        self.last_used
    }

    #[inline]
    pub(crate) fn mark_used(&mut self, frame: FrameCounter) {
        self.last_used = frame;
    }

    #[inline]
    pub fn shader_view(&self) -> Option<DescriptorHandle> {
        self.views.shader
    }

    #[inline]
    pub fn render_view(&self) -> Option<DescriptorHandle> {
        self.views.render
    }

    #[inline]
    pub fn depth_view(&self) -> Option<DescriptorHandle> {
        self.views.depth
    }

    /// Queues a transition to `new_state`.
    ///
    /// No-op if the texture is already in that state. Display images never
    /// become shader-readable; such a request is refused.
    pub fn transition_batched(&mut self, batch: &mut BarrierBatch<B>, new_state: ResourceState) -> bool {
        if self.is_display && new_state == ResourceState::ShaderRead {
            log::warn!("display image cannot be sampled; transition to ShaderRead ignored");
            return false;
        }
        let native = &self.native;
        queue_transition(
            batch,
            || ResourceRef::Texture(native.clone()),
            &mut self.state,
            new_state,
        )
    }

    pub(crate) fn into_parts(self) -> (B::Texture, TextureViews) {
        (self.native, self.views)
    }
}
