//! Fence-tracked submission queue.
//!
//! [`CommandQueue`] is the only place the CPU learns about GPU progress:
//! - `submit`/`signal` hand out strictly increasing fence values
//! - `is_complete` polls lazily and caches the completed value
//! - `wait_blocking` blocks on one backend wait, never spins
//!
//! Submission is serialized by a mutex so several command-list pools (one per
//! recording thread) can share a queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{Backend, FrameTables, QueueKind, Submission};
use crate::command::Command;
use crate::error::{GpuError, GpuResult};
use crate::frame::FenceValue;

pub struct CommandQueue<B: Backend> {
    backend: Arc<B>,
    kind: QueueKind,
    /// Last fence value handed to the backend. Guarded for submission ordering.
    last_signaled: Mutex<FenceValue>,
    /// Cached completed value; only ever raised.
    last_completed: AtomicU64,
    lost: AtomicBool,
}

impl<B: Backend> std::fmt::Debug for CommandQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("kind", &self.kind)
            .field("last_signaled", &*self.last_signaled.lock())
            .field("last_completed", &self.last_completed.load(Ordering::Acquire))
            .field("lost", &self.lost.load(Ordering::Acquire))
            .finish()
    }
}

impl<B: Backend> CommandQueue<B> {
    pub fn new(backend: Arc<B>, kind: QueueKind) -> Self {
        Self {
            backend,
            kind,
            last_signaled: Mutex::new(FenceValue::ZERO),
            last_completed: AtomicU64::new(0),
            lost: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn last_signaled(&self) -> FenceValue {
        *self.last_signaled.lock()
    }

    /// Cached completed value. May lag behind the GPU until the next poll.
    pub fn last_completed(&self) -> FenceValue {
        FenceValue::new(self.last_completed.load(Ordering::Acquire))
    }

    /// Submits a command stream and returns the fence value that marks its completion.
    pub fn submit(
        &self,
        commands: &[Command<B>],
        tables: Option<FrameTables<'_, B>>,
    ) -> GpuResult<FenceValue> {
        self.ensure_alive()?;
        let mut last = self.last_signaled.lock();
        let signal = last.next();
        self.backend
            .submit(Submission {
                queue: self.kind,
                commands,
                tables,
                signal,
            })
            .map_err(|err| self.note_error(err))?;
        *last = signal;
        log::trace!("{:?} queue: submitted {} commands, fence {}", self.kind, commands.len(), signal.get());
        Ok(signal)
    }

    /// Issues a new fence value after everything already enqueued.
    pub fn signal(&self) -> GpuResult<FenceValue> {
        self.submit(&[], None)
    }

    /// Whether `value` has completed. Polls the backend only when the cache
    /// cannot answer.
    pub fn is_complete(&self, value: FenceValue) -> GpuResult<bool> {
        if value.get() <= self.last_completed.load(Ordering::Acquire) {
            return Ok(true);
        }
        self.ensure_alive()?;
        let polled = self
            .backend
            .completed_fence(self.kind)
            .map_err(|err| self.note_error(err))?;
        let completed = self.raise_completed(polled);
        Ok(value <= completed)
    }

    /// Blocks until `value` has completed.
    pub fn wait_blocking(&self, value: FenceValue) -> GpuResult<()> {
        let last_signaled = self.last_signaled();
        if value > last_signaled {
            return Err(GpuError::FenceNotIssued {
                requested: value,
                last_signaled,
            });
        }
        if self.is_complete(value)? {
            return Ok(());
        }
        log::trace!("{:?} queue: blocking on fence {}", self.kind, value.get());
        self.backend
            .wait_fence(self.kind, value)
            .map_err(|err| self.note_error(err))?;
        self.raise_completed(value);
        Ok(())
    }

    /// Blocks until everything submitted so far has completed.
    pub fn wait_idle(&self) -> GpuResult<()> {
        self.wait_blocking(self.last_signaled())
    }

    /// Makes later work on this queue wait on the GPU for its own `value`.
    pub fn insert_wait(&self, value: FenceValue) -> GpuResult<()> {
        self.ensure_alive()?;
        self.backend
            .queue_wait(self.kind, self.kind, value)
            .map_err(|err| self.note_error(err))
    }

    /// Makes later work on this queue wait on the GPU for `value` on `other`.
    pub fn insert_wait_for(&self, other: &CommandQueue<B>, value: FenceValue) -> GpuResult<()> {
        let other_signaled = other.last_signaled();
        if value > other_signaled {
            return Err(GpuError::FenceNotIssued {
                requested: value,
                last_signaled: other_signaled,
            });
        }
        self.ensure_alive()?;
        self.backend
            .queue_wait(self.kind, other.kind, value)
            .map_err(|err| self.note_error(err))
    }

    fn raise_completed(&self, value: FenceValue) -> FenceValue {
        let previous = self.last_completed.fetch_max(value.get(), Ordering::AcqRel);
        FenceValue::new(previous.max(value.get()))
    }

    fn ensure_alive(&self) -> GpuResult<()> {
        if self.is_lost() {
            return Err(GpuError::device_lost("queue is no longer usable"));
        }
        Ok(())
    }

    fn note_error(&self, err: GpuError) -> GpuError {
        if err.is_device_lost() && !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("{:?} queue: {err}", self.kind);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{CompletionMode, HeadlessBackend};

    fn queue(mode: CompletionMode) -> (Arc<HeadlessBackend>, CommandQueue<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new(mode));
        let queue = CommandQueue::new(Arc::clone(&backend), QueueKind::Graphics);
        (backend, queue)
    }

    // ── signaling ─────────────────────────────────────────────────────────

    #[test]
    fn fence_values_increase() {
        let (_, q) = queue(CompletionMode::Immediate);
        let a = q.signal().unwrap();
        let b = q.signal().unwrap();
        assert_eq!(a, FenceValue::new(1));
        assert_eq!(b, FenceValue::new(2));
        assert_eq!(q.last_signaled(), b);
    }

    #[test]
    fn zero_is_always_complete() {
        let (_, q) = queue(CompletionMode::Manual);
        assert!(q.is_complete(FenceValue::ZERO).unwrap());
    }

    // ── completion ────────────────────────────────────────────────────────

    #[test]
    fn completion_is_polled_lazily() {
        let (backend, q) = queue(CompletionMode::Manual);
        let f = q.signal().unwrap();
        assert!(!q.is_complete(f).unwrap());

        backend.complete_through(QueueKind::Graphics, f);
        assert_eq!(q.last_completed(), FenceValue::ZERO);
        assert!(q.is_complete(f).unwrap());
        assert_eq!(q.last_completed(), f);
    }

    #[test]
    fn completed_value_never_decreases() {
        let (_, q) = queue(CompletionMode::Manual);
        q.raise_completed(FenceValue::new(5));
        q.raise_completed(FenceValue::new(3));
        assert_eq!(q.last_completed(), FenceValue::new(5));
    }

    #[test]
    fn lagging_gpu_completes_older_work() {
        let (_, q) = queue(CompletionMode::Lag(2));
        let fences: Vec<_> = (0..4).map(|_| q.signal().unwrap()).collect();
        assert!(q.is_complete(fences[1]).unwrap());
        assert!(!q.is_complete(fences[2]).unwrap());
    }

    // ── waiting ───────────────────────────────────────────────────────────

    #[test]
    fn refuses_to_wait_on_unissued_fence() {
        let (_, q) = queue(CompletionMode::OnWait);
        let err = q.wait_blocking(FenceValue::new(1)).unwrap_err();
        assert!(matches!(err, GpuError::FenceNotIssued { .. }));
    }

    #[test]
    fn wait_skips_backend_when_already_complete() {
        let (backend, q) = queue(CompletionMode::Immediate);
        let f = q.signal().unwrap();
        q.wait_blocking(f).unwrap();
        assert_eq!(backend.stats().blocking_waits, 0);
    }

    #[test]
    fn wait_blocks_until_another_thread_completes() {
        let (backend, q) = queue(CompletionMode::Manual);
        let f = q.signal().unwrap();

        let gpu = Arc::clone(&backend);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            gpu.complete_through(QueueKind::Graphics, f);
        });

        q.wait_blocking(f).unwrap();
        assert!(q.is_complete(f).unwrap());
        worker.join().unwrap();
        assert_eq!(backend.stats().blocking_waits, 1);
    }

    // ── cross-queue ───────────────────────────────────────────────────────

    #[test]
    fn cross_queue_wait_is_recorded_without_blocking() {
        let backend = Arc::new(HeadlessBackend::new(CompletionMode::Manual));
        let graphics = CommandQueue::new(Arc::clone(&backend), QueueKind::Graphics);
        let transfer = CommandQueue::new(Arc::clone(&backend), QueueKind::Transfer);

        let upload = transfer.signal().unwrap();
        graphics.insert_wait_for(&transfer, upload).unwrap();
        graphics.insert_wait(FenceValue::ZERO).unwrap();

        assert_eq!(backend.stats().queue_waits, 2);
        assert_eq!(backend.stats().blocking_waits, 0);
        assert!(graphics.insert_wait_for(&transfer, upload.next()).is_err());
    }

    // ── device loss ───────────────────────────────────────────────────────

    #[test]
    fn device_loss_poisons_the_queue() {
        let (backend, q) = queue(CompletionMode::Immediate);
        backend.lose_device("driver reset");
        assert!(q.signal().unwrap_err().is_device_lost());
        assert!(q.is_lost());
        assert!(q.is_complete(FenceValue::new(7)).unwrap_err().is_device_lost());
    }
}
