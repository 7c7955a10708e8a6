//! Uploads and read-backs through staging buffers.
//!
//! Writes are recorded into the frame being built when there is one, else into
//! a one-off list submitted right away. Reads always use a dedicated list and
//! block until the copy has completed; a synchronous read has no other correct
//! order, so they are refused while a frame is recording.

use super::Device;
use crate::backend::Backend;
use crate::buffer_pool::BufferAllocation;
use crate::command::{Command, CommandList, StagingLayout, STAGING_ROW_ALIGNMENT};
use crate::error::{GpuError, GpuResult};
use crate::handle::{BufferId, TextureId};
use crate::resource::{BarrierBatch, BufferDesc, BufferUsage, ResourceState, TextureRegion, TextureUsage};

/// Row pitch and total staging size for `region` of a `bytes_per_pixel` format.
fn staging_layout(region: &TextureRegion, bytes_per_pixel: u32) -> (StagingLayout, u32, u64) {
    let row_bytes = region.width * bytes_per_pixel;
    let bytes_per_row = row_bytes.next_multiple_of(STAGING_ROW_ALIGNMENT);
    let layout = StagingLayout {
        offset: 0,
        bytes_per_row,
        rows: region.height,
    };
    (layout, row_bytes, u64::from(bytes_per_row) * u64::from(region.height))
}

impl<B: Backend> Device<B> {
    /// Uploads `data` into a texture region.
    pub fn texture_set_data(&mut self, id: TextureId, region: TextureRegion, data: &[u8]) -> GpuResult<()> {
        self.ensure_alive()?;
        let texture = self.textures.get(id).ok_or(GpuError::StaleHandle("texture"))?;
        let desc = texture.desc();
        if !desc.usage.contains(TextureUsage::COPY_DST) {
            return Err(GpuError::InvalidConfig("texture was not created with COPY_DST".into()));
        }
        if !region.fits(desc) {
            return Err(GpuError::InvalidConfig(format!("{region:?} lies outside the texture")));
        }
        let (layout, row_bytes, staging_size) = staging_layout(&region, desc.format.bytes_per_pixel());
        let expected = u64::from(row_bytes) * u64::from(region.height);
        if data.len() as u64 != expected {
            return Err(GpuError::InvalidConfig(format!(
                "texture upload expects {expected} bytes, got {}",
                data.len()
            )));
        }

        // Repack tight rows at the staging pitch.
        let mut staged = vec![0u8; staging_size as usize];
        for (row, src) in data.chunks_exact(row_bytes as usize).enumerate() {
            let start = row * layout.bytes_per_row as usize;
            staged[start..start + src.len()].copy_from_slice(src);
        }
        let staging = self.create_staging(staging_size, BufferUsage::COPY_SRC | BufferUsage::MAP_WRITE)?;
        if let Err(err) = self.backend.write_buffer(staging.native(), 0, &staged) {
            return Err(self.escalate(err));
        }

        let src = staging.native().clone();
        let frame = self.frame;
        let recorded = self.record_transfer(|device, list, barriers| {
            let texture = device.textures.get_mut(id).ok_or(GpuError::StaleHandle("texture"))?;
            texture.mark_used(frame);
            texture.transition_batched(barriers, ResourceState::CopyDest);
            barriers.flush(list);
            list.record(Command::CopyBufferToTexture {
                src,
                layout,
                dst: texture.native().clone(),
                region,
            });
            Ok(())
        });
        self.graveyard.buffers.push(frame, staging);
        recorded
    }

    /// Reads a texture region back as tightly packed rows. Blocks on the GPU.
    pub fn texture_get_data(&mut self, id: TextureId, region: TextureRegion) -> GpuResult<Vec<u8>> {
        self.ensure_alive()?;
        if self.recording.is_some() {
            return Err(GpuError::AlreadyRecording);
        }
        let texture = self.textures.get(id).ok_or(GpuError::StaleHandle("texture"))?;
        let desc = texture.desc();
        if !desc.usage.contains(TextureUsage::COPY_SRC) {
            return Err(GpuError::InvalidConfig("texture was not created with COPY_SRC".into()));
        }
        if desc.sample_count > 1 {
            return Err(GpuError::InvalidConfig("multisampled textures cannot be read back".into()));
        }
        if !region.fits(desc) {
            return Err(GpuError::InvalidConfig(format!("{region:?} lies outside the texture")));
        }
        let (layout, row_bytes, staging_size) = staging_layout(&region, desc.format.bytes_per_pixel());

        let staging = self.create_staging(staging_size, BufferUsage::COPY_DST | BufferUsage::MAP_READ)?;
        let dst = staging.native().clone();
        let frame = self.frame;
        let copied = self.submit_one_off(true, |device, list, barriers| {
            let texture = device.textures.get_mut(id).ok_or(GpuError::StaleHandle("texture"))?;
            texture.mark_used(frame);
            texture.transition_batched(barriers, ResourceState::CopySource);
            barriers.flush(list);
            list.record(Command::CopyTextureToBuffer {
                src: texture.native().clone(),
                region,
                dst,
                layout,
            });
            Ok(())
        });
        let staged = copied.and_then(|()| self.backend.read_buffer(staging.native(), 0, staging_size));
        self.backend.destroy_buffer(staging.into_native());
        let staged = staged.map_err(|err| self.escalate(err))?;

        let mut data = Vec::with_capacity(row_bytes as usize * region.height as usize);
        for row in staged.chunks_exact(layout.bytes_per_row as usize) {
            data.extend_from_slice(&row[..row_bytes as usize]);
        }
        Ok(data)
    }

    /// Copies `len` bytes at `offset` out of a buffer. Blocks on the GPU.
    pub fn read_back(&mut self, id: BufferId, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        self.ensure_alive()?;
        if self.recording.is_some() {
            return Err(GpuError::AlreadyRecording);
        }
        let buffer = self.buffers.get(id).ok_or(GpuError::StaleHandle("buffer"))?;
        if !buffer.desc().usage.contains(BufferUsage::COPY_SRC) {
            return Err(GpuError::InvalidConfig("buffer was not created with COPY_SRC".into()));
        }
        if len == 0 || offset.checked_add(len).is_none_or(|end| end > buffer.desc().size) {
            return Err(GpuError::InvalidConfig(format!(
                "read of {len} bytes at {offset} outside buffer of {} bytes",
                buffer.desc().size
            )));
        }

        let staging = self.create_staging(len, BufferUsage::COPY_DST | BufferUsage::MAP_READ)?;
        let dst = staging.native().clone();
        let frame = self.frame;
        let copied = self.submit_one_off(true, |device, list, barriers| {
            let buffer = device.buffers.get_mut(id).ok_or(GpuError::StaleHandle("buffer"))?;
            buffer.mark_used(frame);
            buffer.transition_batched(barriers, ResourceState::CopySource);
            barriers.flush(list);
            list.record(Command::CopyBuffer {
                src: buffer.native().clone(),
                src_offset: offset,
                dst,
                dst_offset: 0,
                size: len,
            });
            Ok(())
        });
        let data = copied.and_then(|()| self.backend.read_buffer(staging.native(), 0, len));
        self.backend.destroy_buffer(staging.into_native());
        data.map_err(|err| self.escalate(err))
    }

    /// Replaces bytes of a non-dynamic buffer through a staging copy.
    pub(super) fn upload_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let size = data.len() as u64;
        let staging = self.create_staging(size, BufferUsage::COPY_SRC | BufferUsage::MAP_WRITE)?;
        if let Err(err) = self.backend.write_buffer(staging.native(), 0, data) {
            return Err(self.escalate(err));
        }

        let src = staging.native().clone();
        let frame = self.frame;
        let recorded = self.record_transfer(|device, list, barriers| {
            let buffer = device.buffers.get_mut(id).ok_or(GpuError::StaleHandle("buffer"))?;
            buffer.mark_used(frame);
            buffer.transition_batched(barriers, ResourceState::CopyDest);
            barriers.flush(list);
            list.record(Command::CopyBuffer {
                src,
                src_offset: 0,
                dst: buffer.native().clone(),
                dst_offset: offset,
                size,
            });
            Ok(())
        });
        self.graveyard.buffers.push(frame, staging);
        recorded
    }

    fn create_staging(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferAllocation<B>> {
        let desc = BufferDesc::new(size, usage).with_label("staging");
        match self.backend.create_buffer(&desc) {
            Ok(native) => Ok(BufferAllocation::new(native, usage, size)),
            Err(err) => Err(self.escalate(err)),
        }
    }

    /// Records a transfer into the current frame, or submits it on its own.
    ///
    /// Inside a frame the render pass is closed first; the next draw reopens it
    /// and re-applies every binding.
    fn record_transfer(
        &mut self,
        record: impl FnOnce(&mut Self, &mut CommandList<B>, &mut BarrierBatch<B>) -> GpuResult<()>,
    ) -> GpuResult<()> {
        let Some(mut recording) = self.recording.take() else {
            return self.submit_one_off(false, record);
        };
        recording.end_pass();
        let result = record(self, &mut recording.list, &mut recording.barriers);
        if self.lost.is_some() {
            self.commands.abandon(recording.list);
        } else {
            self.recording = Some(recording);
        }
        result
    }

    /// Records into a dedicated list and submits it, optionally waiting.
    fn submit_one_off(
        &mut self,
        blocking: bool,
        record: impl FnOnce(&mut Self, &mut CommandList<B>, &mut BarrierBatch<B>) -> GpuResult<()>,
    ) -> GpuResult<()> {
        let mut list = match self.commands.begin() {
            Ok(list) => list,
            Err(err) => return Err(self.escalate(err)),
        };
        let mut barriers = BarrierBatch::new();
        if let Err(err) = record(self, &mut list, &mut barriers) {
            barriers.discard();
            self.commands.abandon(list);
            return Err(err);
        }
        barriers.flush(&mut list);
        match self.commands.close(list, None, blocking) {
            Ok(fence) => {
                log::trace!("one-off transfer submitted (fence {}, blocking {blocking})", fence.get());
                Ok(())
            }
            Err(err) => Err(self.escalate(err)),
        }
    }
}
