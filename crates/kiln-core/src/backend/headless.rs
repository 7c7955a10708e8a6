//! In-memory backend.
//!
//! Simulates a GPU well enough to drive the whole core without a device:
//! buffers and textures are byte vectors, copies run at submit time, and each
//! queue has a fence timeline whose completion is controlled by a
//! [`CompletionMode`]. Tests use it to inject GPU latency, stalls and device
//! loss; `kiln-studio` uses it as a smoke-test target.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use super::{Backend, QueueKind, Submission};
use crate::command::{Command, StagingLayout};
use crate::error::{GpuError, GpuResult};
use crate::format::{Format, ShaderStage};
use crate::frame::FenceValue;
use crate::pipeline::PipelineDesc;
use crate::resource::{BufferDesc, SamplerDesc, ShaderDesc, TextureDesc, TextureRegion, ViewKind};

/// When the simulated GPU finishes submitted work.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompletionMode {
    /// Work completes as soon as it is submitted.
    Immediate,
    /// The GPU trails the CPU by this many submissions.
    Lag(u64),
    /// Work completes only when the CPU blocks on it.
    OnWait,
    /// Work completes only through [`HeadlessBackend::complete_through`].
    Manual,
}

/// Counters of native calls seen by the backend.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeadlessStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub textures_created: u64,
    pub textures_destroyed: u64,
    pub samplers_created: u64,
    pub shaders_created: u64,
    pub pipelines_built: u64,
    pub submissions: u64,
    /// Native barrier calls. One per flushed batch.
    pub barrier_calls: u64,
    /// Individual transitions across all barrier calls.
    pub barriers: u64,
    pub draws: u64,
    pub presents: u64,
    pub blocking_waits: u64,
    pub queue_waits: u64,
}

impl HeadlessStats {
    pub fn live_buffers(&self) -> u64 {
        self.buffers_created - self.buffers_destroyed
    }

    pub fn live_textures(&self) -> u64 {
        self.textures_created - self.textures_destroyed
    }
}

/// What one submission referenced, kept for inspection.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SubmissionRecord {
    pub queue: QueueKind,
    pub signal: FenceValue,
    /// Buffer ids bound as vertex, index or uniform sources.
    pub bound_buffers: Vec<u64>,
    pub draws: u32,
}

const SUBMISSION_HISTORY: usize = 64;

#[derive(Debug, Clone)]
pub struct HeadlessBuffer {
    id: u64,
    data: Arc<Mutex<Vec<u8>>>,
}

impl HeadlessBuffer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessTexture {
    id: u64,
    format: Format,
    width: u32,
    height: u32,
    mip_levels: u32,
    /// One tightly packed image per (layer, mip).
    subresources: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl HeadlessTexture {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn mip_width(&self, mip: u32) -> u32 {
        (self.width >> mip).max(1)
    }

    fn subresource(&self, region: &TextureRegion) -> usize {
        (region.layer * self.mip_levels + region.mip_level) as usize
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeadlessView {
    pub texture: u64,
    pub kind: ViewKind,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeadlessSampler {
    pub id: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeadlessShader {
    pub id: u64,
    pub stage: ShaderStage,
    pub entry_point: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeadlessPipeline {
    pub id: u64,
}

#[derive(Debug, Default)]
struct TimelineState {
    signaled: u64,
    completed: u64,
}

#[derive(Debug, Default)]
struct Timeline {
    state: Mutex<TimelineState>,
    advanced: Condvar,
}

#[derive(Debug)]
pub struct HeadlessBackend {
    mode: Mutex<CompletionMode>,
    timelines: [Timeline; QueueKind::COUNT],
    stats: Mutex<HeadlessStats>,
    history: Mutex<VecDeque<SubmissionRecord>>,
    lost: Mutex<Option<String>>,
    present_failure: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HeadlessBackend {
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            timelines: Default::default(),
            stats: Mutex::new(HeadlessStats::default()),
            history: Mutex::new(VecDeque::with_capacity(SUBMISSION_HISTORY)),
            lost: Mutex::new(None),
            present_failure: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn mode(&self) -> CompletionMode {
        *self.mode.lock()
    }

    /// Changes how future submissions complete. Already-submitted work keeps
    /// its current completion state.
    pub fn set_mode(&self, mode: CompletionMode) {
        *self.mode.lock() = mode;
    }

    pub fn stats(&self) -> HeadlessStats {
        *self.stats.lock()
    }

    /// The most recent submissions, oldest first.
    pub fn recent_submissions(&self) -> Vec<SubmissionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Marks everything up to `value` on `queue` as finished and wakes waiters.
    pub fn complete_through(&self, queue: QueueKind, value: FenceValue) {
        let timeline = &self.timelines[queue.index()];
        let mut state = timeline.state.lock();
        state.completed = state.completed.max(value.get());
        timeline.advanced.notify_all();
    }

    /// Simulates a removed or reset device. Every later call fails.
    pub fn lose_device(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("headless backend: device lost ({reason})");
        *self.lost.lock() = Some(reason);
        for timeline in &self.timelines {
            let _state = timeline.state.lock();
            timeline.advanced.notify_all();
        }
    }

    /// Makes the next `present` fail with a backend error. The device stays alive.
    pub fn fail_next_present(&self, reason: impl Into<String>) {
        *self.present_failure.lock() = Some(reason.into());
    }

    fn check_alive(&self) -> GpuResult<()> {
        match self.lost.lock().as_ref() {
            Some(reason) => Err(GpuError::device_lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn execute(&self, commands: &[Command<Self>], has_tables: bool) -> GpuResult<(Vec<u64>, u32)> {
        let mut bound = Vec::new();
        let mut draws = 0u32;
        let mut barrier_calls = 0u64;
        let mut barriers = 0u64;

        for command in commands {
            match command {
                Command::Barriers(batch) => {
                    barrier_calls += 1;
                    barriers += batch.len() as u64;
                }
                Command::SetVertexBuffer { buffer, .. }
                | Command::SetIndexBuffer { buffer, .. }
                | Command::SetUniform { buffer, .. } => bound.push(buffer.id),
                Command::BindTextures(_) | Command::BindSamplers(_) if !has_tables => {
                    return Err(GpuError::Backend("descriptor table bound without shader-visible tables".into()));
                }
                Command::Draw { .. } | Command::DrawIndexed { .. } => draws += 1,
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => copy_buffer(src, *src_offset, dst, *dst_offset, *size)?,
                Command::CopyBufferToTexture {
                    src,
                    layout,
                    dst,
                    region,
                } => copy_buffer_to_texture(src, layout, dst, region)?,
                Command::CopyTextureToBuffer {
                    src,
                    region,
                    dst,
                    layout,
                } => copy_texture_to_buffer(src, region, dst, layout)?,
                _ => {}
            }
        }

        let mut stats = self.stats.lock();
        stats.barrier_calls += barrier_calls;
        stats.barriers += barriers;
        stats.draws += u64::from(draws);
        Ok((bound, draws))
    }
}

fn out_of_bounds(what: &str) -> GpuError {
    GpuError::Backend(format!("{what} out of bounds"))
}

fn byte_range(offset: u64, len: u64, total: usize) -> GpuResult<std::ops::Range<usize>> {
    let end = offset.checked_add(len).ok_or_else(|| out_of_bounds("range"))?;
    if end > total as u64 {
        return Err(out_of_bounds("range"));
    }
    Ok(offset as usize..end as usize)
}

fn copy_buffer(src: &HeadlessBuffer, src_offset: u64, dst: &HeadlessBuffer, dst_offset: u64, size: u64) -> GpuResult<()> {
    if Arc::ptr_eq(&src.data, &dst.data) {
        let mut data = src.data.lock();
        let from = byte_range(src_offset, size, data.len())?;
        let to = byte_range(dst_offset, size, data.len())?;
        data.copy_within(from, to.start);
        return Ok(());
    }
    let src = src.data.lock();
    let mut dst = dst.data.lock();
    let from = byte_range(src_offset, size, src.len())?;
    let to = byte_range(dst_offset, size, dst.len())?;
    dst[to].copy_from_slice(&src[from]);
    Ok(())
}

fn copy_buffer_to_texture(
    src: &HeadlessBuffer,
    layout: &StagingLayout,
    dst: &HeadlessTexture,
    region: &TextureRegion,
) -> GpuResult<()> {
    let bpp = u64::from(dst.format.bytes_per_pixel());
    let row_bytes = u64::from(region.width) * bpp;
    let mip_width = u64::from(dst.mip_width(region.mip_level));
    let src = src.data.lock();
    let mut subresources = dst.subresources.lock();
    let image = subresources
        .get_mut(dst.subresource(region))
        .ok_or_else(|| out_of_bounds("texture subresource"))?;

    for row in 0..u64::from(region.height) {
        let from = byte_range(layout.offset + row * u64::from(layout.bytes_per_row), row_bytes, src.len())?;
        let texel = (u64::from(region.y) + row) * mip_width + u64::from(region.x);
        let to = byte_range(texel * bpp, row_bytes, image.len())?;
        image[to].copy_from_slice(&src[from]);
    }
    Ok(())
}

fn copy_texture_to_buffer(
    src: &HeadlessTexture,
    region: &TextureRegion,
    dst: &HeadlessBuffer,
    layout: &StagingLayout,
) -> GpuResult<()> {
    let bpp = u64::from(src.format.bytes_per_pixel());
    let row_bytes = u64::from(region.width) * bpp;
    let mip_width = u64::from(src.mip_width(region.mip_level));
    let subresources = src.subresources.lock();
    let image = subresources
        .get(src.subresource(region))
        .ok_or_else(|| out_of_bounds("texture subresource"))?;
    let mut dst = dst.data.lock();

    for row in 0..u64::from(region.height) {
        let texel = (u64::from(region.y) + row) * mip_width + u64::from(region.x);
        let from = byte_range(texel * bpp, row_bytes, image.len())?;
        let to = byte_range(layout.offset + row * u64::from(layout.bytes_per_row), row_bytes, dst.len())?;
        dst[to].copy_from_slice(&image[from]);
    }
    Ok(())
}

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type TextureView = HeadlessView;
    type Sampler = HeadlessSampler;
    type Shader = HeadlessShader;
    type Pipeline = HeadlessPipeline;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<HeadlessBuffer> {
        self.check_alive()?;
        let len = usize::try_from(desc.size).map_err(|_| GpuError::creation("buffer", "size does not fit in memory"))?;
        self.stats.lock().buffers_created += 1;
        Ok(HeadlessBuffer {
            id: self.next_id(),
            data: Arc::new(Mutex::new(vec![0; len])),
        })
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<HeadlessTexture> {
        self.check_alive()?;
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(GpuError::creation("texture", "zero-sized texture"));
        }
        let bpp = desc.format.bytes_per_pixel() as usize;
        let mut subresources = Vec::with_capacity((desc.array_layers * desc.mip_levels) as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                let w = (desc.width >> mip).max(1) as usize;
                let h = (desc.height >> mip).max(1) as usize;
                subresources.push(vec![0; w * h * bpp]);
            }
        }
        self.stats.lock().textures_created += 1;
        Ok(HeadlessTexture {
            id: self.next_id(),
            format: desc.format,
            width: desc.width,
            height: desc.height,
            mip_levels: desc.mip_levels,
            subresources: Arc::new(Mutex::new(subresources)),
        })
    }

    fn create_view(&self, texture: &HeadlessTexture, _desc: &TextureDesc, kind: ViewKind) -> GpuResult<HeadlessView> {
        self.check_alive()?;
        Ok(HeadlessView {
            texture: texture.id,
            kind,
        })
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> GpuResult<HeadlessSampler> {
        self.check_alive()?;
        self.stats.lock().samplers_created += 1;
        Ok(HeadlessSampler { id: self.next_id() })
    }

    fn create_shader(&self, desc: &ShaderDesc) -> GpuResult<HeadlessShader> {
        self.check_alive()?;
        if desc.bytecode.is_empty() {
            return Err(GpuError::creation("shader", "empty bytecode"));
        }
        self.stats.lock().shaders_created += 1;
        Ok(HeadlessShader {
            id: self.next_id(),
            stage: desc.stage,
            entry_point: desc.entry_point.clone(),
        })
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        self.stats.lock().buffers_destroyed += 1;
        drop(buffer);
    }

    fn destroy_texture(&self, texture: HeadlessTexture) {
        self.stats.lock().textures_destroyed += 1;
        drop(texture);
    }

    fn build_pipeline(
        &self,
        _desc: &PipelineDesc,
        vertex: &HeadlessShader,
        fragment: Option<&HeadlessShader>,
    ) -> GpuResult<HeadlessPipeline> {
        self.check_alive()?;
        if vertex.stage != ShaderStage::Vertex || fragment.is_some_and(|f| f.stage != ShaderStage::Fragment) {
            return Err(GpuError::creation("pipeline", "shader stage mismatch"));
        }
        self.stats.lock().pipelines_built += 1;
        Ok(HeadlessPipeline { id: self.next_id() })
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.check_alive()?;
        let mut bytes = buffer.data.lock();
        let range = byte_range(offset, data.len() as u64, bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, len: u64) -> GpuResult<Vec<u8>> {
        self.check_alive()?;
        let bytes = buffer.data.lock();
        let range = byte_range(offset, len, bytes.len())?;
        Ok(bytes[range].to_vec())
    }

    fn submit(&self, submission: Submission<'_, Self>) -> GpuResult<()> {
        self.check_alive()?;
        let (bound_buffers, draws) = self.execute(submission.commands, submission.tables.is_some())?;

        let timeline = &self.timelines[submission.queue.index()];
        {
            let mut state = timeline.state.lock();
            let signal = submission.signal.get();
            if signal <= state.signaled {
                return Err(GpuError::Backend(format!(
                    "fence {signal} signaled out of order (last {})",
                    state.signaled
                )));
            }
            state.signaled = signal;
            match self.mode() {
                CompletionMode::Immediate => state.completed = signal,
                CompletionMode::Lag(k) => state.completed = state.completed.max(signal.saturating_sub(k)),
                CompletionMode::OnWait | CompletionMode::Manual => {}
            }
            timeline.advanced.notify_all();
        }

        self.stats.lock().submissions += 1;
        let mut history = self.history.lock();
        if history.len() == SUBMISSION_HISTORY {
            history.pop_front();
        }
        history.push_back(SubmissionRecord {
            queue: submission.queue,
            signal: submission.signal,
            bound_buffers,
            draws,
        });
        Ok(())
    }

    fn completed_fence(&self, queue: QueueKind) -> GpuResult<FenceValue> {
        self.check_alive()?;
        Ok(FenceValue::new(self.timelines[queue.index()].state.lock().completed))
    }

    fn wait_fence(&self, queue: QueueKind, value: FenceValue) -> GpuResult<()> {
        self.check_alive()?;
        self.stats.lock().blocking_waits += 1;

        let timeline = &self.timelines[queue.index()];
        let mut state = timeline.state.lock();
        if value.get() > state.signaled {
            return Err(GpuError::FenceNotIssued {
                requested: value,
                last_signaled: FenceValue::new(state.signaled),
            });
        }
        if self.mode() != CompletionMode::Manual {
            state.completed = state.completed.max(value.get());
            return Ok(());
        }
        while state.completed < value.get() {
            self.check_alive()?;
            timeline.advanced.wait(&mut state);
        }
        Ok(())
    }

    fn queue_wait(&self, _queue: QueueKind, _on: QueueKind, _value: FenceValue) -> GpuResult<()> {
        self.check_alive()?;
        self.stats.lock().queue_waits += 1;
        Ok(())
    }

    fn present(&self, _image: &HeadlessTexture, _sync_interval: u32) -> GpuResult<()> {
        self.check_alive()?;
        if let Some(reason) = self.present_failure.lock().take() {
            return Err(GpuError::Backend(format!("present failed: {reason}")));
        }
        self.stats.lock().presents += 1;
        Ok(())
    }
}
