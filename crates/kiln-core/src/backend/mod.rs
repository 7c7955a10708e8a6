//! Capability interface between the core and a native graphics API.
//!
//! The core only needs a handful of primitives from the layer below it:
//! - a submission queue with a monotonic fence
//! - explicit resource transitions (carried inside the command stream)
//! - fixed-capacity descriptor tables (filled by the core, read at submit)
//! - immutable, hashable pipeline objects
//!
//! Every native API is one implementation of [`Backend`]. The frame ring, pools
//! and caches above it are shared.

use std::fmt;

use crate::command::Command;
use crate::descriptor::ShaderVisibleHeap;
use crate::error::GpuResult;
use crate::frame::FenceValue;
use crate::pipeline::PipelineDesc;
use crate::resource::{BufferDesc, SamplerDesc, ShaderDesc, TextureDesc, ViewKind};

pub mod headless;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// Hardware queue a submission targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

impl QueueKind {
    pub const COUNT: usize = 2;

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            QueueKind::Graphics => 0,
            QueueKind::Transfer => 1,
        }
    }
}

/// Shader-visible descriptor tables referenced by a command stream.
pub struct FrameTables<'a, B: Backend> {
    pub textures: &'a ShaderVisibleHeap<B::TextureView>,
    pub samplers: &'a ShaderVisibleHeap<B::Sampler>,
}

/// One recorded command stream ready for execution.
pub struct Submission<'a, B: Backend> {
    pub queue: QueueKind,
    pub commands: &'a [Command<B>],
    /// Tables that `BindTextures` / `BindSamplers` commands index into.
    pub tables: Option<FrameTables<'a, B>>,
    /// Fence value the queue signals once the commands complete.
    pub signal: FenceValue,
}

/// A native graphics API as seen by the core.
///
/// Methods take `&self`; implementations synchronize internally. Queue
/// submission is additionally serialized by [`crate::queue::CommandQueue`].
pub trait Backend: fmt::Debug + Send + Sync + Sized + 'static {
    type Buffer: Clone + fmt::Debug + Send + Sync;
    type Texture: Clone + fmt::Debug + Send + Sync;
    type TextureView: Clone + fmt::Debug + Send + Sync;
    type Sampler: Clone + fmt::Debug + Send + Sync;
    type Shader: Clone + fmt::Debug + Send + Sync;
    type Pipeline: Clone + fmt::Debug + Send + Sync;

    // ── resources ─────────────────────────────────────────────────────────

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Self::Buffer>;

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<Self::Texture>;

    fn create_view(
        &self,
        texture: &Self::Texture,
        desc: &TextureDesc,
        kind: ViewKind,
    ) -> GpuResult<Self::TextureView>;

    fn create_sampler(&self, desc: &SamplerDesc) -> GpuResult<Self::Sampler>;

    /// Wraps a pre-built shader module. The bytecode is opaque to the core.
    fn create_shader(&self, desc: &ShaderDesc) -> GpuResult<Self::Shader>;

    /// Physically frees a buffer. Called only once the GPU can no longer read it.
    fn destroy_buffer(&self, buffer: Self::Buffer) {
        drop(buffer);
    }

    /// Physically frees a texture. Called only once the GPU can no longer read it.
    fn destroy_texture(&self, texture: Self::Texture) {
        drop(texture);
    }

    /// Builds a native pipeline object. This is the expensive call the
    /// pipeline cache memoizes.
    fn build_pipeline(
        &self,
        desc: &PipelineDesc,
        vertex: &Self::Shader,
        fragment: Option<&Self::Shader>,
    ) -> GpuResult<Self::Pipeline>;

    /// Writes into a CPU-visible allocation. Ordered before the next submission.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Reads a read-back allocation. The caller has already waited for the copy.
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, len: u64) -> GpuResult<Vec<u8>>;

    // ── queue ─────────────────────────────────────────────────────────────

    /// Executes a command stream and arranges for `submission.signal` to be
    /// reported by [`Backend::completed_fence`] once it finishes.
    fn submit(&self, submission: Submission<'_, Self>) -> GpuResult<()>;

    /// Highest fence value the queue has completed.
    fn completed_fence(&self, queue: QueueKind) -> GpuResult<FenceValue>;

    /// Blocks the calling thread until `value` completes on `queue`.
    fn wait_fence(&self, queue: QueueKind, value: FenceValue) -> GpuResult<()>;

    /// Makes `queue` wait on the GPU for `value` on queue `on`, without blocking the CPU.
    fn queue_wait(&self, queue: QueueKind, on: QueueKind, value: FenceValue) -> GpuResult<()>;

    // ── display ───────────────────────────────────────────────────────────

    /// Hands a display image to the presentation engine.
    fn present(&self, image: &Self::Texture, sync_interval: u32) -> GpuResult<()>;
}
