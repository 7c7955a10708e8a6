//! GPU resources and their access-state machine.
//!
//! Every buffer and texture tracks the state the GPU last saw it in. Moving to
//! another state goes through [`BarrierBatch`]: the resource's tracked state is
//! updated immediately, and the barrier itself is queued until the batch is
//! flushed into a command list with a single native call.

mod buffer;
mod destroy;
mod sampler;
mod shader;
mod texture;

pub use buffer::{Buffer, BufferDesc, BufferUsage};
pub use destroy::DestroyQueue;
pub use sampler::{AddressMode, FilterMode, SamplerDesc};
pub use shader::ShaderDesc;
pub use texture::{Texture, TextureDesc, TextureRegion, TextureUsage, ViewKind};
pub(crate) use texture::TextureViews;

use crate::backend::Backend;
use crate::command::{Command, CommandList};

/// Access state of a resource, as seen by the GPU.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum ResourceState {
    #[default]
    Initial,
    CopyDest,
    CopySource,
    ShaderRead,
    RenderTarget,
    DepthWrite,
    Present,
    UnorderedAccess,
    GenericRead,
}

/// Native resource a barrier applies to.
#[derive(Debug)]
pub enum ResourceRef<B: Backend> {
    Buffer(B::Buffer),
    Texture(B::Texture),
}

/// One state transition.
#[derive(Debug)]
pub struct Barrier<B: Backend> {
    pub resource: ResourceRef<B>,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Pending transitions of one recording context.
///
/// Owned by whoever records a command list; never shared between lists.
#[derive(Debug)]
pub struct BarrierBatch<B: Backend> {
    pending: Vec<Barrier<B>>,
}

impl<B: Backend> Default for BarrierBatch<B> {
    fn default() -> Self {
        Self { pending: Vec::new() }
    }
}

impl<B: Backend> BarrierBatch<B> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, barrier: Barrier<B>) {
        self.pending.push(barrier);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records every pending barrier as one command. Returns how many were flushed.
    pub fn flush(&mut self, list: &mut CommandList<B>) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        let count = self.pending.len();
        list.record(Command::Barriers(std::mem::take(&mut self.pending)));
        count
    }

    /// Drops queued barriers without recording them (the list they targeted was abandoned).
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

/// Shared transition logic for buffers and textures.
///
/// Returns `true` when a barrier was queued.
pub(crate) fn queue_transition<B: Backend>(
    batch: &mut BarrierBatch<B>,
    resource: impl FnOnce() -> ResourceRef<B>,
    state: &mut ResourceState,
    new_state: ResourceState,
) -> bool {
    if *state == new_state {
        return false;
    }
    batch.push(Barrier {
        resource: resource(),
        before: *state,
        after: new_state,
    });
    *state = new_state;
    true
}
