use crate::error::{GpuError, GpuResult};

use super::{DescriptorHandle, DescriptorHeap, HeapKind};

/// A contiguous run of a shader-visible heap, bound with one call.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct DescriptorTable {
    pub base: u32,
    pub count: u32,
}

/// Per-frame-slot heap the GPU reads bindings from.
///
/// The write cursor restarts at zero every frame. Each draw copies its bound
/// descriptors from a CPU-visible heap into the next free run, so the GPU only
/// ever sees a base index plus a count.
#[derive(Debug)]
pub struct ShaderVisibleHeap<D> {
    kind: HeapKind,
    capacity: u32,
    entries: Vec<Option<D>>,
}

impl<D: Clone> ShaderVisibleHeap<D> {
    pub fn new(kind: HeapKind, capacity: u32) -> Self {
        Self {
            kind,
            capacity,
            entries: Vec::new(),
        }
    }

    /// Rewinds the cursor. Only valid once the slot's fence has completed.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub fn cursor(&self) -> u32 {
        self.entries.len() as u32
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Copies the descriptors behind `handles` into a fresh contiguous run.
    ///
    /// Unbound (`None`) or stale slots copy as empty entries.
    pub fn copy_table(
        &mut self,
        source: &DescriptorHeap<D>,
        handles: &[Option<DescriptorHandle>],
    ) -> GpuResult<DescriptorTable> {
        let base = self.cursor();
        let count = handles.len() as u32;
        if base.checked_add(count).is_none_or(|end| end > self.capacity) {
            log::error!(
                "shader-visible {:?} heap exhausted: {} + {} > {}",
                self.kind,
                base,
                count,
                self.capacity
            );
            return Err(GpuError::HeapExhausted {
                kind: self.kind,
                capacity: self.capacity,
            });
        }
        self.entries.extend(
            handles
                .iter()
                .map(|handle| handle.and_then(|h| source.get(h).cloned())),
        );
        Ok(DescriptorTable { base, count })
    }

    pub fn entries(&self, table: DescriptorTable) -> &[Option<D>] {
        let start = table.base as usize;
        let end = start + table.count as usize;
        self.entries.get(start..end).unwrap_or_default()
    }
}
