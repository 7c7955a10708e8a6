use std::collections::HashMap;

use crate::error::GpuResult;

use super::PipelineKey;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub builds: u64,
    /// Distinct keys that shared a 64-bit hash.
    pub collisions: u64,
}

/// Memoizes native pipeline objects by their aggregate state.
///
/// A hit compares the full key, not just its hash, so a hash collision costs
/// an extra build instead of returning the wrong pipeline. Entries are never
/// evicted; the set of states an application uses is bounded.
#[derive(Debug)]
pub struct PipelineCache<P> {
    entries: HashMap<u64, Vec<(PipelineKey, P)>>,
    stats: CacheStats,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }
}

impl<P: Clone> PipelineCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pipeline for `key`, or builds and caches one.
    ///
    /// `build` runs at most once per distinct key. It is the one place a draw
    /// may stall on the driver.
    pub fn get_or_create(
        &mut self,
        key: &PipelineKey,
        build: impl FnOnce() -> GpuResult<P>,
    ) -> GpuResult<P> {
        let key = key.normalized();
        let hash = super::hash_key(&key);
        self.get_or_create_hashed(key, hash, build)
    }

    pub(crate) fn get_or_create_hashed(
        &mut self,
        key: PipelineKey,
        hash: u64,
        build: impl FnOnce() -> GpuResult<P>,
    ) -> GpuResult<P> {
        let bucket = self.entries.entry(hash).or_default();
        if let Some((_, pipeline)) = bucket.iter().find(|(k, _)| bytemuck::bytes_of(k) == bytemuck::bytes_of(&key)) {
            self.stats.hits += 1;
            return Ok(pipeline.clone());
        }

        if !bucket.is_empty() {
            self.stats.collisions += 1;
            log::warn!("pipeline cache: hash collision on {hash:#018x}");
        }
        let pipeline = build()?;
        self.stats.builds += 1;
        log::debug!("pipeline cache: built pipeline {hash:#018x} ({} cached)", self.stats.builds);
        bucket.push((key, pipeline.clone()));
        Ok(pipeline)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(Vec::is_empty)
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;
    use crate::error::GpuError;

    fn key(vertex_shader: u64) -> PipelineKey {
        PipelineKey {
            vertex_shader,
            ..PipelineKey::zeroed()
        }
    }

    // ── idempotence ───────────────────────────────────────────────────────

    #[test]
    fn second_lookup_is_a_hit() {
        let mut cache = PipelineCache::new();
        let mut builds = 0;
        let a = cache.get_or_create(&key(1), || { builds += 1; Ok(builds) }).unwrap();
        let b = cache.get_or_create(&key(1), || { builds += 1; Ok(builds) }).unwrap();

        assert_eq!(a, b);
        assert_eq!(builds, 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, builds: 1, collisions: 0 });
    }

    #[test]
    fn padding_only_difference_is_a_hit() {
        let mut cache = PipelineCache::new();
        let clean = key(7);
        let mut dirty = clean;
        dirty.raster._pad = [0xFF; 3];
        dirty.depth_stencil._pad = [0x11, 0x22];

        let a = cache.get_or_create(&clean, || Ok("native")).unwrap();
        let b = cache.get_or_create(&dirty, || Ok("rebuilt")).unwrap();
        assert_eq!((a, b), ("native", "native"));
        assert_eq!(cache.stats().builds, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_keys_build_separately() {
        let mut cache = PipelineCache::new();
        cache.get_or_create(&key(1), || Ok(1)).unwrap();
        cache.get_or_create(&key(2), || Ok(2)).unwrap();
        assert_eq!(cache.stats().builds, 2);
        assert_eq!(cache.len(), 2);
    }

    // ── failure modes ─────────────────────────────────────────────────────

    #[test]
    fn colliding_hashes_fall_back_to_full_comparison() {
        let mut cache = PipelineCache::new();
        let a = cache.get_or_create_hashed(key(1), 42, || Ok("a")).unwrap();
        let b = cache.get_or_create_hashed(key(2), 42, || Ok("b")).unwrap();
        let a_again = cache.get_or_create_hashed(key(1), 42, || Ok("wrong")).unwrap();

        assert_eq!((a, b, a_again), ("a", "b", "a"));
        assert_eq!(cache.stats(), CacheStats { hits: 1, builds: 2, collisions: 1 });
    }

    #[test]
    fn failed_build_is_not_cached() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        let err = cache
            .get_or_create(&key(3), || Err(GpuError::creation("pipeline", "bad shader")))
            .unwrap_err();
        assert!(matches!(err, GpuError::Creation { .. }));
        assert_eq!(cache.get_or_create(&key(3), || Ok(9)).unwrap(), 9);
        assert_eq!(cache.stats().builds, 1);
    }
}
