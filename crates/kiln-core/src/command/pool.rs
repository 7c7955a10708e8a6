use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::{Backend, FrameTables};
use crate::error::GpuResult;
use crate::frame::FenceValue;
use crate::queue::CommandQueue;

use super::{CommandAllocator, CommandList};

/// Recycles command lists and their allocators.
///
/// Allocators wait in a FIFO tagged with the fence that guards them. Since
/// fences complete in submission order, only the front entry ever needs
/// checking: if it is not safe yet, nothing behind it is either.
///
/// One pool per recording thread. Pools may share a [`CommandQueue`].
#[derive(Debug)]
pub struct CommandListPool<B: Backend> {
    queue: Arc<CommandQueue<B>>,
    free_lists: Vec<CommandList<B>>,
    allocators: VecDeque<(FenceValue, CommandAllocator<B>)>,
    next_list_id: u32,
    next_allocator_id: u32,
}

impl<B: Backend> CommandListPool<B> {
    pub fn new(queue: Arc<CommandQueue<B>>) -> Self {
        Self {
            queue,
            free_lists: Vec::new(),
            allocators: VecDeque::new(),
            next_list_id: 0,
            next_allocator_id: 0,
        }
    }

    #[inline]
    pub fn queue(&self) -> &Arc<CommandQueue<B>> {
        &self.queue
    }

    /// Returns a list ready to record into.
    pub fn begin(&mut self) -> GpuResult<CommandList<B>> {
        let allocator = self.new_allocator()?;
        let mut list = match self.free_lists.pop() {
            Some(list) => list,
            None => {
                let id = self.next_list_id;
                self.next_list_id += 1;
                log::debug!("command pool: new list {id}");
                CommandList::new(id)
            }
        };
        list.attach(allocator);
        Ok(list)
    }

    /// Submits `list` and returns the fence value guarding its allocator.
    ///
    /// With `blocking`, waits for that fence before returning.
    pub fn close(
        &mut self,
        mut list: CommandList<B>,
        tables: Option<FrameTables<'_, B>>,
        blocking: bool,
    ) -> GpuResult<FenceValue> {
        let submitted = self.queue.submit(list.commands(), tables);
        let allocator = list.detach();
        self.free_lists.push(list);

        let fence = submitted?;
        if let Some(allocator) = allocator {
            self.allocators.push_back((fence, allocator));
        }
        if blocking {
            self.queue.wait_blocking(fence)?;
        }
        Ok(fence)
    }

    /// Returns a list without submitting it. Its allocator is reusable at once.
    pub fn abandon(&mut self, mut list: CommandList<B>) {
        if let Some(mut allocator) = list.detach() {
            allocator.reset();
            self.allocators.push_front((FenceValue::ZERO, allocator));
        }
        self.free_lists.push(list);
    }

    /// Pops the oldest allocator if its fence has completed, else makes a new one.
    fn new_allocator(&mut self) -> GpuResult<CommandAllocator<B>> {
        if let Some(&(tag, _)) = self.allocators.front() {
            if self.queue.is_complete(tag)? {
                if let Some((_, mut allocator)) = self.allocators.pop_front() {
                    allocator.reset();
                    log::trace!("command pool: reusing allocator {} (fence {})", allocator.id(), tag.get());
                    return Ok(allocator);
                }
            }
        }
        let id = self.next_allocator_id;
        self.next_allocator_id += 1;
        log::debug!("command pool: new allocator {id}");
        Ok(CommandAllocator::new(id))
    }

    /// Allocators ever created by this pool.
    #[inline]
    pub fn allocator_count(&self) -> usize {
        self.next_allocator_id as usize
    }

    /// Command lists ever created by this pool.
    #[inline]
    pub fn list_count(&self) -> usize {
        self.next_list_id as usize
    }

    /// Allocators currently waiting for reuse.
    #[inline]
    pub fn parked_allocators(&self) -> usize {
        self.allocators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueKind;
    use crate::backend::headless::{CompletionMode, HeadlessBackend};
    use crate::command::{Command, Viewport};

    fn pool(mode: CompletionMode) -> (Arc<HeadlessBackend>, CommandListPool<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new(mode));
        let queue = Arc::new(CommandQueue::new(Arc::clone(&backend), QueueKind::Graphics));
        (backend, CommandListPool::new(queue))
    }

    // ── recycling ─────────────────────────────────────────────────────────

    #[test]
    fn begin_returns_recording_list() {
        let (_, mut pool) = pool(CompletionMode::Immediate);
        let mut list = pool.begin().unwrap();
        assert!(list.is_recording());
        list.record(Command::SetViewport(Viewport::new(4.0, 4.0)));
        assert_eq!(list.len(), 1);

        pool.close(list, None, false).unwrap();
        let list = pool.begin().unwrap();
        assert!(list.is_empty(), "reused allocator must be reset");
        assert_eq!(pool.list_count(), 1);
    }

    #[test]
    fn busy_allocator_is_not_reused() {
        let (backend, mut pool) = pool(CompletionMode::Manual);
        let first = pool.begin().unwrap();
        let first_allocator = first.allocator_id();
        let fence = pool.close(first, None, false).unwrap();

        let second = pool.begin().unwrap();
        assert_ne!(second.allocator_id(), first_allocator);
        pool.abandon(second);

        backend.complete_through(QueueKind::Graphics, fence);
        // The abandoned allocator went to the front and is handed out first.
        let third = pool.begin().unwrap();
        assert_eq!(third.allocator_id(), Some(1));
        let fourth = pool.begin().unwrap();
        assert_eq!(fourth.allocator_id(), first_allocator);
        assert_eq!(pool.allocator_count(), 2);
    }

    #[test]
    fn blocking_close_waits_for_fence() {
        let (backend, mut pool) = pool(CompletionMode::OnWait);
        let list = pool.begin().unwrap();
        let fence = pool.close(list, None, true).unwrap();
        assert!(pool.queue().is_complete(fence).unwrap());
        assert_eq!(backend.stats().blocking_waits, 1);
    }

    // ── steady state ──────────────────────────────────────────────────────

    #[test]
    fn allocator_count_converges_to_frames_in_flight() {
        for frames in 2..=3usize {
            // The GPU trails the CPU by frames - 1 submissions.
            let (_, mut pool) = pool(CompletionMode::Lag(frames as u64 - 1));
            for _ in 0..50 {
                let list = pool.begin().unwrap();
                pool.close(list, None, false).unwrap();
            }
            assert_eq!(pool.allocator_count(), frames);
            assert_eq!(pool.list_count(), 1);
        }
    }

    #[test]
    fn stalled_gpu_grows_allocators_then_recovers() {
        let (backend, mut pool) = pool(CompletionMode::Manual);
        let mut last = FenceValue::ZERO;
        for _ in 0..5 {
            let list = pool.begin().unwrap();
            last = pool.close(list, None, false).unwrap();
        }
        assert_eq!(pool.allocator_count(), 5);

        backend.complete_through(QueueKind::Graphics, last);
        for _ in 0..20 {
            let list = pool.begin().unwrap();
            let fence = pool.close(list, None, false).unwrap();
            backend.complete_through(QueueKind::Graphics, fence);
        }
        assert_eq!(pool.allocator_count(), 5);
    }

    #[test]
    fn pools_share_one_queue() {
        let backend = Arc::new(HeadlessBackend::new(CompletionMode::Immediate));
        let queue = Arc::new(CommandQueue::new(Arc::clone(&backend), QueueKind::Graphics));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut pool = CommandListPool::new(queue);
                    (0..25)
                        .map(|_| {
                            let list = pool.begin().unwrap();
                            pool.close(list, None, false).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut fences: Vec<u64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .map(FenceValue::get)
            .collect();
        fences.sort_unstable();
        assert_eq!(fences, (1..=100).collect::<Vec<_>>());
        assert_eq!(backend.stats().submissions, 100);
    }
}
