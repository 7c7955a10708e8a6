use std::collections::VecDeque;

use crate::frame::FrameCounter;

/// FIFO of objects waiting until the GPU can no longer reference them.
///
/// Entries are stamped with the frame they were destroyed in. Stamps are
/// pushed in non-decreasing order, so a sweep stops at the first entry that is
/// still too young.
#[derive(Debug)]
pub struct DestroyQueue<T> {
    entries: VecDeque<(FrameCounter, T)>,
}

impl<T> Default for DestroyQueue<T> {
    fn default() -> Self {
        Self { entries: VecDeque::new() }
    }
}

impl<T> DestroyQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, stamped: FrameCounter, item: T) {
        debug_assert!(
            self.entries.back().is_none_or(|(last, _)| *last <= stamped),
            "destroy queue stamps must be non-decreasing"
        );
        self.entries.push_back((stamped, item));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pops every entry at least `free_frames` old relative to `current`.
    pub fn sweep(&mut self, current: FrameCounter, free_frames: u16) -> Vec<T> {
        let mut freed = Vec::new();
        while let Some((stamped, _)) = self.entries.front() {
            if !current.has_aged(*stamped, free_frames) {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                freed.push(item);
            }
        }
        freed
    }

    /// Pops everything. Only valid once the GPU is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(v: u64) -> FrameCounter {
        FrameCounter::new(v)
    }

    #[test]
    fn young_entries_survive() {
        let mut q = DestroyQueue::new();
        q.push(f(10), "a");
        assert!(q.sweep(f(10), 2).is_empty());
        assert!(q.sweep(f(11), 2).is_empty());
        assert_eq!(q.sweep(f(12), 2), ["a"]);
        assert!(q.is_empty());
    }

    #[test]
    fn sweep_is_fifo_and_stops_at_first_young_entry() {
        let mut q = DestroyQueue::new();
        q.push(f(1), 1);
        q.push(f(2), 2);
        q.push(f(5), 3);
        assert_eq!(q.sweep(f(4), 2), [1, 2]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.sweep(f(7), 2), [3]);
    }

    #[test]
    fn sweep_across_16_bit_wrap() {
        let mut q = DestroyQueue::new();
        q.push(f(0xFFFE), 'x');
        assert!(q.sweep(f(0xFFFF), 2).is_empty());
        assert_eq!(q.sweep(f(0x1_0000), 2), ['x']);
    }

    #[test]
    fn drain_all_ignores_age() {
        let mut q = DestroyQueue::new();
        q.push(f(3), 'a');
        q.push(f(3), 'b');
        assert_eq!(q.drain_all(), ['a', 'b']);
    }
}
