use std::collections::HashMap;
use std::sync::Arc;

use crate::frame::FrameCounter;

use super::{hash_key, PackedState};

struct Entry<T: PackedState> {
    state: Arc<T>,
    key: T::Key,
    /// Frame the cache became the only owner, if it is.
    orphaned_at: Option<FrameCounter>,
}

/// Interns immutable state objects behind shared handles.
///
/// Creating an identical state twice returns the same `Arc`. Ownership is
/// automatic: once nothing outside the cache holds an entry, the sweep drops
/// it after `free_frames` frames.
pub struct StateCache<T: PackedState + PartialEq> {
    entries: HashMap<u64, Vec<Entry<T>>>,
    label: &'static str,
}

impl<T: PackedState + PartialEq> std::fmt::Debug for StateCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("label", &self.label)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: PackedState + PartialEq> StateCache<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            entries: HashMap::new(),
            label,
        }
    }

    /// Returns the shared handle for `state`, creating it on first sight.
    ///
    /// A hit needs both the packed key and the state itself to match.
    pub fn intern(&mut self, state: T) -> Arc<T> {
        let key = state.pack();
        let bucket = self.entries.entry(hash_key(&key)).or_default();
        if let Some(entry) = bucket
            .iter_mut()
            .find(|e| bytemuck::bytes_of(&e.key) == bytemuck::bytes_of(&key) && *e.state == state)
        {
            entry.orphaned_at = None;
            return Arc::clone(&entry.state);
        }

        let state = Arc::new(state);
        bucket.push(Entry {
            state: Arc::clone(&state),
            key,
            orphaned_at: None,
        });
        log::trace!("{} cache: interned new state ({} live)", self.label, self.len());
        state
    }

    /// Releases entries nothing else has referenced for `free_frames` frames.
    /// Returns how many were dropped.
    pub fn sweep(&mut self, current: FrameCounter, free_frames: u16) -> usize {
        let mut released = 0;
        for bucket in self.entries.values_mut() {
            bucket.retain_mut(|entry| {
                if Arc::strong_count(&entry.state) > 1 {
                    entry.orphaned_at = None;
                    return true;
                }
                let since = *entry.orphaned_at.get_or_insert(current);
                let keep = !current.has_aged(since, free_frames);
                if !keep {
                    released += 1;
                }
                keep
            });
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        if released > 0 {
            log::debug!("{} cache: released {released} states", self.label);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::VertexFormat;
    use crate::pipeline::{BlendState, RasterState, VertexAttribute, VertexBufferLayout, VertexLayout, VertexStepMode};

    /// Packs only `key`, so distinct values can share a packed key.
    #[derive(Debug, PartialEq)]
    struct Lossy {
        key: u32,
        extra: u8,
    }

    impl PackedState for Lossy {
        type Key = u32;

        fn pack(&self) -> u32 {
            self.key
        }
    }

    fn layout_with_last(format: VertexFormat) -> VertexLayout {
        let mut attributes: Vec<_> = (0..7)
            .map(|i| VertexAttribute { location: i, slot: 0, format: VertexFormat::Float32, offset: u32::from(i) * 4 })
            .collect();
        attributes.push(VertexAttribute { location: 7, slot: 0, format, offset: 28 });
        VertexLayout::new(attributes, vec![VertexBufferLayout { stride: 44, step: VertexStepMode::Vertex }]).unwrap()
    }

    #[test]
    fn identical_states_share_one_handle() {
        let mut cache = StateCache::new("blend");
        let a = cache.intern(BlendState::ALPHA_BLENDING);
        let b = cache.intern(BlendState::ALPHA_BLENDING);
        let c = cache.intern(BlendState::OPAQUE);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn equal_keys_with_different_states_stay_distinct() {
        let mut cache = StateCache::new("lossy");
        let a = cache.intern(Lossy { key: 1, extra: 0 });
        let b = cache.intern(Lossy { key: 1, extra: 7 });
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.extra, 7);
        assert_eq!(cache.len(), 2);
        assert!(Arc::ptr_eq(&b, &cache.intern(Lossy { key: 1, extra: 7 })));
    }

    #[test]
    fn layouts_differing_in_the_last_attribute_are_distinct() {
        let mut cache = StateCache::new("layout");
        let a = cache.intern(layout_with_last(VertexFormat::Float32));
        let b = cache.intern(layout_with_last(VertexFormat::Float32x4));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.attributes()[7].format, VertexFormat::Float32x4);
    }

    #[test]
    fn referenced_states_survive_sweep() {
        let mut cache = StateCache::new("raster");
        let held = cache.intern(RasterState::default());
        for frame in 0..10 {
            assert_eq!(cache.sweep(FrameCounter::new(frame), 2), 0);
        }
        assert_eq!(cache.len(), 1);
        drop(held);
    }

    #[test]
    fn orphaned_state_is_released_after_free_frames() {
        let mut cache = StateCache::new("blend");
        drop(cache.intern(BlendState::ALPHA_BLENDING));

        assert_eq!(cache.sweep(FrameCounter::new(5), 2), 0);
        assert_eq!(cache.sweep(FrameCounter::new(6), 2), 0);
        assert_eq!(cache.sweep(FrameCounter::new(7), 2), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinterning_resets_the_orphan_clock() {
        let mut cache = StateCache::new("blend");
        drop(cache.intern(BlendState::OPAQUE));
        cache.sweep(FrameCounter::new(1), 2);

        let again = cache.intern(BlendState::OPAQUE);
        assert_eq!(cache.sweep(FrameCounter::new(3), 2), 0);
        drop(again);
        assert_eq!(cache.sweep(FrameCounter::new(4), 2), 0);
        assert_eq!(cache.sweep(FrameCounter::new(6), 2), 1);
    }
}
