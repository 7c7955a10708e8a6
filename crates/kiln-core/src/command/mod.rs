//! Recorded command streams.
//!
//! The core records into a portable [`Command`] stream; the backend translates
//! it at submission. A [`CommandAllocator`] owns the stream's storage, and like
//! a native allocator it may only be reset once the GPU finished executing it.

mod pool;

pub use pool::CommandListPool;

use crate::backend::Backend;
use crate::descriptor::DescriptorTable;
use crate::format::{IndexFormat, ShaderStage};
use crate::resource::{Barrier, TextureRegion};

/// Viewport in physical pixels.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle in physical pixels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct ColorAttachment<B: Backend> {
    pub view: B::TextureView,
    /// `None` loads the existing contents.
    pub clear: Option<[f64; 4]>,
}

#[derive(Debug)]
pub struct DepthAttachment<B: Backend> {
    pub view: B::TextureView,
    pub clear_depth: Option<f32>,
    pub clear_stencil: Option<u32>,
    /// Whether the format carries a stencil aspect.
    pub has_stencil: bool,
}

/// Placement of texel rows inside a staging buffer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StagingLayout {
    pub offset: u64,
    /// Row pitch in bytes, a multiple of [`STAGING_ROW_ALIGNMENT`].
    pub bytes_per_row: u32,
    pub rows: u32,
}

/// Row pitch alignment for buffer ↔ texture copies.
pub const STAGING_ROW_ALIGNMENT: u32 = 256;

/// One recorded GPU command.
#[derive(Debug)]
pub enum Command<B: Backend> {
    /// A batch of transitions issued as one native call.
    Barriers(Vec<Barrier<B>>),
    BeginPass {
        colors: Vec<ColorAttachment<B>>,
        depth: Option<DepthAttachment<B>>,
    },
    EndPass,
    SetPipeline(B::Pipeline),
    SetVertexBuffer {
        slot: u32,
        buffer: B::Buffer,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: B::Buffer,
        offset: u64,
        format: IndexFormat,
    },
    SetUniform {
        stage: ShaderStage,
        slot: u32,
        buffer: B::Buffer,
        offset: u64,
        size: u64,
    },
    /// Binds a contiguous run of the shader-visible texture table.
    BindTextures(DescriptorTable),
    /// Binds a contiguous run of the shader-visible sampler table.
    BindSamplers(DescriptorTable),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    CopyBuffer {
        src: B::Buffer,
        src_offset: u64,
        dst: B::Buffer,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: B::Buffer,
        layout: StagingLayout,
        dst: B::Texture,
        region: TextureRegion,
    },
    CopyTextureToBuffer {
        src: B::Texture,
        region: TextureRegion,
        dst: B::Buffer,
        layout: StagingLayout,
    },
}

/// Backing storage of a command list.
#[derive(Debug)]
pub struct CommandAllocator<B: Backend> {
    id: u32,
    commands: Vec<Command<B>>,
}

impl<B: Backend> CommandAllocator<B> {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            commands: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Drops recorded commands and keeps the capacity.
    pub(crate) fn reset(&mut self) {
        self.commands.clear();
    }
}

/// A command-recording object.
///
/// A list is bound to an allocator while recording; closing it hands the
/// allocator back to the pool, tagged with the fence that guards it.
#[derive(Debug)]
pub struct CommandList<B: Backend> {
    id: u32,
    allocator: Option<CommandAllocator<B>>,
}

impl<B: Backend> CommandList<B> {
    pub(crate) fn new(id: u32) -> Self {
        Self { id, allocator: None }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.allocator.is_some()
    }

    /// Allocator currently backing the list, if recording.
    pub fn allocator_id(&self) -> Option<u32> {
        self.allocator.as_ref().map(CommandAllocator::id)
    }

    pub fn record(&mut self, command: Command<B>) {
        match self.allocator.as_mut() {
            Some(allocator) => allocator.commands.push(command),
            None => debug_assert!(false, "recording into a closed command list"),
        }
    }

    pub fn commands(&self) -> &[Command<B>] {
        self.allocator
            .as_ref()
            .map(|a| a.commands.as_slice())
            .unwrap_or_default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands().is_empty()
    }

    pub(crate) fn attach(&mut self, allocator: CommandAllocator<B>) {
        debug_assert!(self.allocator.is_none(), "command list already recording");
        self.allocator = Some(allocator);
    }

    pub(crate) fn detach(&mut self) -> Option<CommandAllocator<B>> {
        self.allocator.take()
    }
}
