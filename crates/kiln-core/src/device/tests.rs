use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;
use crate::backend::headless::{CompletionMode, HeadlessBackend};
use crate::buffer_pool::BufferClass;
use crate::command::Viewport;
use crate::config::HeapSizes;
use crate::descriptor::HeapKind;
use crate::format::{Format, ShaderStage};
use crate::pipeline::BlendState;
use crate::resource::{SamplerDesc, ShaderDesc, TextureRegion};

type TestDevice = Device<HeadlessBackend>;

fn small_config() -> DeviceConfig {
    DeviceConfig {
        width: 64,
        height: 64,
        uniform_ring_size: 4096,
        ..DeviceConfig::default()
    }
}

fn device_with(mode: CompletionMode, config: DeviceConfig) -> (Arc<HeadlessBackend>, TestDevice) {
    let backend = Arc::new(HeadlessBackend::new(mode));
    let device = Device::new(Arc::clone(&backend), config).unwrap();
    (backend, device)
}

fn device(mode: CompletionMode) -> (Arc<HeadlessBackend>, TestDevice) {
    device_with(mode, small_config())
}

fn bind_shaders(device: &mut TestDevice) {
    let vs = device
        .create_shader(&ShaderDesc::new(ShaderStage::Vertex, "vs_main", b"vs".to_vec()))
        .unwrap();
    let fs = device
        .create_shader(&ShaderDesc::new(ShaderStage::Fragment, "fs_main", b"fs".to_vec()))
        .unwrap();
    device.set_shaders(vs, Some(fs));
}

fn empty_frame(device: &mut TestDevice) {
    device.begin_frame().unwrap();
    device.present(1).unwrap();
}

fn recorded(device: &TestDevice) -> &[Command<HeadlessBackend>] {
    device.recording.as_ref().map(|r| r.list.commands()).unwrap_or_default()
}

fn count(commands: &[Command<HeadlessBackend>], pred: impl Fn(&Command<HeadlessBackend>) -> bool) -> usize {
    commands.iter().filter(|c| pred(c)).count()
}

// ── construction ──────────────────────────────────────────────────────────

#[test]
fn creates_display_images_and_depth_target() {
    let (backend, device) = device(CompletionMode::Immediate);
    assert_eq!(device.frames_in_flight(), 2);
    for i in 0..2 {
        let image = device.texture(device.display_image(i).unwrap()).unwrap();
        assert!(image.is_display());
        assert!(image.render_view().is_some());
        assert!(image.shader_view().is_none());
    }
    let depth = device.texture(device.default_depth_target().unwrap()).unwrap();
    assert!(depth.depth_view().is_some());
    assert_eq!(backend.stats().textures_created, 3);
    assert_eq!(device.heaps.render_target.live(), 2);
}

#[test]
fn rejects_invalid_config() {
    let backend = Arc::new(HeadlessBackend::new(CompletionMode::Immediate));
    let config = DeviceConfig {
        back_buffer_count: 4,
        ..small_config()
    };
    assert!(matches!(Device::new(backend, config), Err(GpuError::InvalidConfig(_))));
}

// ── frame pacing ──────────────────────────────────────────────────────────

#[test]
fn begin_frame_waits_for_the_fence_of_n_frames_ago() {
    let (backend, mut device) = device(CompletionMode::OnWait);
    let mut fences = Vec::new();

    for i in 0..8 {
        let slot = device.begin_frame().unwrap();
        if i >= 2 {
            let completed = backend.completed_fence(QueueKind::Graphics).unwrap();
            assert!(completed >= fences[i - 2], "frame {i} began before fence {:?}", fences[i - 2]);
        }
        device.present(1).unwrap();
        fences.push(device.slot_fence(slot).unwrap());
    }

    // The first two slots were fresh; every later one had to wait exactly once.
    assert_eq!(device.stats().blocking_waits, 6);
    assert_eq!(fences.iter().map(|f| f.get()).collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());
}

#[test]
fn frame_pacing_against_a_gpu_thread() {
    let (backend, mut device) = device(CompletionMode::Manual);
    let stop = Arc::new(AtomicBool::new(false));

    let gpu = {
        let queue = Arc::clone(device.queue());
        let backend = Arc::clone(&backend);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut completed = 0;
            while !stop.load(Ordering::Acquire) {
                if completed < queue.last_signaled().get() {
                    thread::sleep(Duration::from_millis(1));
                    completed += 1;
                    backend.complete_through(QueueKind::Graphics, FenceValue::new(completed));
                } else {
                    thread::sleep(Duration::from_micros(100));
                }
            }
        })
    };

    let mut fences = Vec::new();
    for i in 0..12 {
        let slot = device.begin_frame().unwrap();
        if i >= 2 {
            assert!(backend.completed_fence(QueueKind::Graphics).unwrap() >= fences[i - 2]);
        }
        device.present(0).unwrap();
        fences.push(device.slot_fence(slot).unwrap());
    }

    device.wait_for_gpu().unwrap();
    drop(device);
    stop.store(true, Ordering::Release);
    gpu.join().unwrap();
}

#[test]
fn slot_status_follows_the_frame_lifecycle() {
    let (_backend, mut device) = device(CompletionMode::OnWait);
    assert_eq!(device.slot_status(0), Some(SlotStage::Idle));
    assert_eq!(device.slot_status(1), Some(SlotStage::Idle));
    assert_eq!(device.slot_status(2), None);

    device.begin_frame().unwrap();
    assert_eq!(device.slot_status(0), Some(SlotStage::Recording));
    device.present(1).unwrap();
    assert_eq!(device.slot_status(0), Some(SlotStage::Submitted));

    device.wait_for_gpu().unwrap();
    assert_eq!(device.slot_status(0), Some(SlotStage::Complete));
    assert_eq!(device.slot_status(1), Some(SlotStage::Idle));
}

#[test]
fn recording_calls_are_refused_outside_a_frame() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    assert_eq!(device.present(1), Err(GpuError::NotRecording));
    assert_eq!(device.draw(3, 1, 0, 0), Err(GpuError::NotRecording));
    assert_eq!(
        device.set_uniform_data(ShaderStage::Vertex, 0, &[0; 16]),
        Err(GpuError::NotRecording)
    );

    device.begin_frame().unwrap();
    assert_eq!(device.begin_frame(), Err(GpuError::AlreadyRecording));
}

// ── command allocators ────────────────────────────────────────────────────

#[test]
fn allocator_count_converges_to_frames_in_flight() {
    for frames in 2..=3 {
        let config = DeviceConfig {
            back_buffer_count: frames,
            ..small_config()
        };
        let (_backend, mut device) = device_with(CompletionMode::Lag(frames as u64 - 1), config);
        for _ in 0..50 {
            empty_frame(&mut device);
        }
        let stats = device.stats();
        assert_eq!(stats.command_allocators, frames);
        assert_eq!(stats.blocking_waits, 0);
    }
}

// ── draws ─────────────────────────────────────────────────────────────────

#[test]
fn draw_requires_complete_state() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    device.begin_frame().unwrap();
    assert_eq!(device.draw(3, 1, 0, 0), Err(GpuError::IncompleteState("vertex shader")));

    bind_shaders(&mut device);
    assert_eq!(
        device.draw_indexed(3, 1, 0, 0, 0),
        Err(GpuError::IncompleteState("index buffer"))
    );
    device.draw(3, 1, 0, 0).unwrap();
    device.present(1).unwrap();
    assert_eq!(device.stats().draws, 1);
}

#[test]
fn identical_state_builds_one_pipeline() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);

    for _ in 0..4 {
        device.begin_frame().unwrap();
        device.draw(3, 1, 0, 0).unwrap();
        device.draw(3, 1, 0, 0).unwrap();
        device.present(1).unwrap();
    }
    assert_eq!(backend.stats().pipelines_built, 1);
    let stats = device.stats().pipelines;
    assert_eq!((stats.builds, stats.hits), (1, 3));

    let alpha = device.create_blend_state(BlendState::ALPHA_BLENDING);
    assert!(Arc::ptr_eq(&alpha, &device.create_blend_state(BlendState::ALPHA_BLENDING)));
    device.begin_frame().unwrap();
    device.set_blend_state(alpha);
    device.draw(3, 1, 0, 0).unwrap();
    device.present(1).unwrap();
    assert_eq!(backend.stats().pipelines_built, 2);
}

#[test]
fn setters_only_dirty_on_change() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    device.begin_frame().unwrap();
    device.draw(3, 1, 0, 0).unwrap();
    assert!(device.dirty.is_empty());

    device.set_viewport(Viewport::new(64.0, 64.0));
    device.set_scissor(None);
    device.set_blend_state(Arc::clone(&device.state.blend));
    assert!(device.dirty.is_empty());

    device.set_viewport(Viewport::new(32.0, 32.0));
    assert_eq!(device.dirty, DirtyFlags::VIEWPORT);
    device.draw(3, 1, 0, 0).unwrap();
    assert_eq!(
        count(recorded(&device), |c| matches!(c, Command::SetViewport(v) if v.width == 32.0)),
        1
    );
}

#[test]
fn transitions_are_flushed_in_one_batch() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    let desc = TextureDesc::new_2d(4, 4, Format::Rgba8Unorm, TextureUsage::SAMPLED);
    for slot in 0..3 {
        let texture = device.create_texture(desc.clone()).unwrap();
        device.set_texture(slot, Some(texture));
    }

    let before = backend.stats();
    device.begin_frame().unwrap();
    device.draw(3, 1, 0, 0).unwrap();
    device.present(1).unwrap();
    let after = backend.stats();

    // Display, depth and three textures before the pass; display to present after it.
    assert_eq!(after.barrier_calls - before.barrier_calls, 2);
    assert_eq!(after.barriers - before.barriers, 6);
}

#[test]
fn display_image_is_never_sampled() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    let slot = device.begin_frame().unwrap();
    let display = device.display_image(slot).unwrap();
    device.set_texture(0, Some(display));
    device.draw(3, 1, 0, 0).unwrap();
    assert_eq!(device.texture(display).unwrap().state(), ResourceState::RenderTarget);
    device.present(1).unwrap();
    assert_eq!(device.texture(display).unwrap().state(), ResourceState::Present);
}

#[test]
fn sampling_a_render_target_breaks_the_pass() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    let target = device
        .create_texture(TextureDesc::new_2d(
            16,
            16,
            Format::Rgba8Unorm,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ))
        .unwrap();

    let slot = device.begin_frame().unwrap();
    device.set_render_targets(&[target], None).unwrap();
    device.draw(3, 1, 0, 0).unwrap();
    assert_eq!(device.texture(target).unwrap().state(), ResourceState::RenderTarget);

    let display = device.display_image(slot).unwrap();
    let depth = device.default_depth_target();
    device.set_render_targets(&[display], depth).unwrap();
    device.set_texture(0, Some(target));
    device.draw(3, 1, 0, 0).unwrap();
    assert_eq!(device.texture(target).unwrap().state(), ResourceState::ShaderRead);

    let commands = recorded(&device);
    assert_eq!(count(commands, |c| matches!(c, Command::BeginPass { .. })), 2);
    assert_eq!(count(commands, |c| matches!(c, Command::EndPass)), 1);
    device.present(1).unwrap();
    // Target formats are part of the pipeline key.
    assert_eq!(backend.stats().pipelines_built, 2);

    assert!(matches!(
        device.set_render_targets(&[target; 5], None),
        Err(GpuError::InvalidConfig(_))
    ));
}

#[test]
fn clear_restarts_the_pass_with_clear_values() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    device.begin_frame().unwrap();
    device
        .clear(ClearFlags::COLOR | ClearFlags::DEPTH, [0.1, 0.2, 0.3, 1.0], 1.0, 0)
        .unwrap();
    device.draw(3, 1, 0, 0).unwrap();

    let commands = recorded(&device);
    assert_eq!(count(commands, |c| matches!(c, Command::BeginPass { .. })), 1);
    let Some(Command::BeginPass { colors, depth }) = commands.iter().find(|c| matches!(c, Command::BeginPass { .. }))
    else {
        panic!("no render pass recorded");
    };
    assert_eq!(colors[0].clear, Some([0.1, 0.2, 0.3, 1.0]));
    let depth = depth.as_ref().unwrap();
    assert_eq!(depth.clear_depth, Some(1.0));
    assert_eq!(depth.clear_stencil, None);
    assert!(depth.has_stencil);
    device.present(1).unwrap();
}

#[test]
fn uniform_ring_is_per_slot_and_reset_each_frame() {
    let config = DeviceConfig {
        uniform_ring_size: 512,
        ..small_config()
    };
    let (_backend, mut device) = device_with(CompletionMode::Immediate, config);
    bind_shaders(&mut device);

    device.begin_frame().unwrap();
    device.set_uniform_data(ShaderStage::Vertex, 0, &[1; 16]).unwrap();
    device.set_uniform_data(ShaderStage::Fragment, 0, &[2; 64]).unwrap();
    assert_eq!(device.slots[0].uniforms.used(), 256 + 64);
    assert_eq!(
        device.set_uniform_data(ShaderStage::Vertex, 1, &[3; 16]),
        Err(GpuError::RingExhausted {
            requested: 16,
            capacity: 512
        })
    );
    device.draw(3, 1, 0, 0).unwrap();
    assert_eq!(count(recorded(&device), |c| matches!(c, Command::SetUniform { .. })), 2);
    device.present(1).unwrap();

    empty_frame(&mut device);
    device.begin_frame().unwrap();
    assert_eq!(device.slots[0].uniforms.used(), 0);
    device.present(1).unwrap();
}

// ── buffer renaming ───────────────────────────────────────────────────────

#[test]
fn ten_frames_of_discards_stay_within_two_pooled_buffers() {
    let (backend, mut device) = device(CompletionMode::Lag(1));
    bind_shaders(&mut device);
    let buffer = device
        .create_buffer(BufferDesc::new(1024, BufferUsage::VERTEX).dynamic(), None)
        .unwrap();

    for frame in 0..10u8 {
        device.begin_frame().unwrap();
        device.map_write(buffer, 0, &[frame; 1024], WriteMode::Discard).unwrap();
        device.set_vertex_buffer(0, Some(buffer), 0);
        device.draw(3, 1, 0, 0).unwrap();

        // No binding may point at an allocation that is still retired.
        for id in device.state.bound_buffers() {
            let allocation = device.buffer(id).unwrap().allocation().id();
            assert!(!device.buffer_pools.is_in_flight(allocation));
        }
        let bound = device.buffer(buffer).unwrap().native().id();
        device.present(1).unwrap();
        assert_eq!(backend.recent_submissions().last().unwrap().bound_buffers, [bound]);
    }

    let stats = device.stats();
    assert_eq!(stats.frames_presented, 10);
    assert_eq!(stats.peak_pooled_buffers, 2);
    assert_eq!(stats.pool_allocations, 3);
    assert_eq!(stats.blocking_waits, 0);
}

#[test]
fn discard_rebinds_the_new_allocation_within_a_frame() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    bind_shaders(&mut device);
    let buffer = device
        .create_buffer(BufferDesc::new(256, BufferUsage::VERTEX).dynamic(), Some(&[1; 256]))
        .unwrap();

    device.begin_frame().unwrap();
    device.set_vertex_buffer(0, Some(buffer), 0);
    device.draw(3, 1, 0, 0).unwrap();
    let first = device.buffer(buffer).unwrap().native().id();
    let retired = device.buffer(buffer).unwrap().allocation().id();

    device.map_write(buffer, 0, &[2; 256], WriteMode::Discard).unwrap();
    assert!(device.buffer_pools.is_in_flight(retired));
    assert!(device.dirty.contains(DirtyFlags::VERTEX_BUFFERS));
    device.draw(3, 1, 0, 0).unwrap();
    let second = device.buffer(buffer).unwrap().native().id();
    device.present(1).unwrap();

    assert_ne!(first, second);
    assert_eq!(backend.recent_submissions().last().unwrap().bound_buffers, [first, second]);
}

#[test]
fn destroyed_dynamic_buffer_returns_to_its_pool() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let a = device
        .create_buffer(BufferDesc::new(512, BufferUsage::UNIFORM).dynamic(), None)
        .unwrap();
    device.destroy_buffer(a).unwrap();
    assert_eq!(device.destroy_buffer(a), Err(GpuError::StaleHandle("buffer")));
    empty_frame(&mut device);
    empty_frame(&mut device);

    let b = device
        .create_buffer(BufferDesc::new(300, BufferUsage::UNIFORM).dynamic(), None)
        .unwrap();
    assert_eq!(device.stats().pool_allocations, 1);
    assert_eq!(device.buffer(b).unwrap().size(), 300);
}

// ── reclamation ───────────────────────────────────────────────────────────

#[test]
fn destroyed_objects_are_freed_after_the_reclamation_threshold() {
    for free_frames in [2u16, 3] {
        let config = DeviceConfig {
            free_frames,
            ..small_config()
        };
        let (backend, mut device) = device_with(CompletionMode::Immediate, config);
        for _ in 0..3 {
            empty_frame(&mut device);
        }
        let buffer = device
            .create_buffer(BufferDesc::new(64, BufferUsage::VERTEX), None)
            .unwrap();
        let destroyed_before = backend.stats().buffers_destroyed;

        device.begin_frame().unwrap();
        let stamped = device.frame();
        device.destroy_buffer(buffer).unwrap();
        device.present(1).unwrap();

        for age in 1..u64::from(free_frames) {
            device.begin_frame().unwrap();
            assert_eq!(device.frame().get(), stamped.get() + age);
            assert_eq!(backend.stats().buffers_destroyed, destroyed_before, "freed too early");
            assert_eq!(device.pending_destroys(), 1);
            device.present(1).unwrap();
        }
        device.begin_frame().unwrap();
        assert_eq!(backend.stats().buffers_destroyed, destroyed_before + 1, "freed too late");
        assert_eq!(device.pending_destroys(), 0);
        device.present(1).unwrap();
    }
}

#[test]
fn threshold_never_undercuts_frames_in_flight() {
    let config = DeviceConfig {
        back_buffer_count: 3,
        free_frames: 1,
        ..small_config()
    };
    let (_backend, device) = device_with(CompletionMode::Immediate, config);
    assert_eq!(device.reclaim_frames, 3);
}

#[test]
fn unreferenced_state_objects_are_released() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    assert_eq!(device.blend_states.len(), 1);
    drop(device.create_blend_state(BlendState::ALPHA_BLENDING));
    assert_eq!(device.blend_states.len(), 2);

    for _ in 0..3 {
        empty_frame(&mut device);
    }
    assert_eq!(device.blend_states.len(), 1);
}

#[test]
fn display_images_cannot_be_destroyed() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let display = device.display_image(0).unwrap();
    assert!(matches!(device.destroy_texture(display), Err(GpuError::InvalidConfig(_))));
    assert!(device.texture(display).is_some());
}

// ── descriptor heaps ──────────────────────────────────────────────────────

#[test]
fn sampler_heap_exhaustion_is_reported_and_recovers_after_reclaim() {
    let config = DeviceConfig {
        heap_sizes: HeapSizes {
            sampler: 2,
            ..HeapSizes::default()
        },
        ..small_config()
    };
    let (_backend, mut device) = device_with(CompletionMode::Immediate, config);
    let desc = SamplerDesc::default();
    let first = device.create_sampler(&desc).unwrap();
    device.create_sampler(&desc).unwrap();
    assert_eq!(
        device.create_sampler(&desc),
        Err(GpuError::HeapExhausted {
            kind: HeapKind::Sampler,
            capacity: 2
        })
    );

    device.destroy_sampler(first).unwrap();
    assert!(device.create_sampler(&desc).is_err());
    empty_frame(&mut device);
    empty_frame(&mut device);
    device.begin_frame().unwrap();
    device.create_sampler(&desc).unwrap();
    device.present(1).unwrap();
}

#[test]
fn query_slots_come_from_the_query_heap() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let query = device.create_query().unwrap();
    assert_eq!(query.kind(), HeapKind::Query);
    device.destroy_query(query).unwrap();
    for _ in 0..2 {
        empty_frame(&mut device);
    }
    device.begin_frame().unwrap();
    assert_eq!(device.destroy_query(query), Err(GpuError::StaleHandle("query")));
}

// ── transfers ─────────────────────────────────────────────────────────────

#[test]
fn texture_region_round_trip() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let usage = TextureUsage::SAMPLED | TextureUsage::COPY_DST | TextureUsage::COPY_SRC;
    let texture = device
        .create_texture(TextureDesc::new_2d(8, 4, Format::Rgba8Unorm, usage))
        .unwrap();

    let region = TextureRegion {
        x: 2,
        y: 1,
        layer: 0,
        mip_level: 0,
        width: 4,
        height: 2,
    };
    let texels: Vec<u8> = (0..32).collect();
    device.texture_set_data(texture, region, &texels).unwrap();
    assert_eq!(device.texture_get_data(texture, region).unwrap(), texels);

    let whole = TextureRegion::full(device.texture(texture).unwrap().desc());
    let full = device.texture_get_data(texture, whole).unwrap();
    assert_eq!(full.len(), 8 * 4 * 4);
    assert_eq!(&full[(8 + 2) * 4..(8 + 6) * 4], &texels[..16]);
    assert!(full[..8 * 4].iter().all(|&b| b == 0));
}

#[test]
fn texture_upload_inside_a_frame_lands_at_present() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let usage = TextureUsage::SAMPLED | TextureUsage::COPY_DST | TextureUsage::COPY_SRC;
    let texture = device
        .create_texture(TextureDesc::new_2d(2, 2, Format::R8Unorm, usage))
        .unwrap();
    let region = TextureRegion::full(device.texture(texture).unwrap().desc());

    device.begin_frame().unwrap();
    device.texture_set_data(texture, region, &[9, 8, 7, 6]).unwrap();
    assert_eq!(device.texture_get_data(texture, region), Err(GpuError::AlreadyRecording));
    device.present(1).unwrap();
    assert_eq!(device.texture_get_data(texture, region).unwrap(), [9, 8, 7, 6]);

    assert!(matches!(
        device.texture_set_data(texture, region, &[1, 2, 3]),
        Err(GpuError::InvalidConfig(_))
    ));
}

#[test]
fn buffer_writes_and_read_back() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let initial: Vec<u8> = (0..64).collect();
    let buffer = device
        .create_buffer(BufferDesc::new(64, BufferUsage::VERTEX | BufferUsage::COPY_SRC), Some(&initial))
        .unwrap();
    assert_eq!(device.read_back(buffer, 4, 8).unwrap(), &initial[4..12]);

    device.map_write(buffer, 0, &[0xAA; 4], WriteMode::NoOverwrite).unwrap();
    assert_eq!(device.read_back(buffer, 0, 6).unwrap(), [0xAA, 0xAA, 0xAA, 0xAA, 4, 5]);

    device.begin_frame().unwrap();
    device.map_write(buffer, 60, &[0x55; 4], WriteMode::Discard).unwrap();
    assert_eq!(device.read_back(buffer, 0, 4), Err(GpuError::AlreadyRecording));
    device.present(1).unwrap();
    assert_eq!(device.read_back(buffer, 60, 4).unwrap(), [0x55; 4]);

    assert!(matches!(
        device.map_write(buffer, 62, &[0; 4], WriteMode::NoOverwrite),
        Err(GpuError::InvalidConfig(_))
    ));
}

#[test]
fn read_back_requires_copy_src() {
    let (_backend, mut device) = device(CompletionMode::Immediate);
    let vertices = device
        .create_buffer(BufferDesc::new(64, BufferUsage::VERTEX), Some(&[7; 64]))
        .unwrap();
    let sprites = device
        .create_buffer(BufferDesc::new(64, BufferUsage::VERTEX).dynamic(), None)
        .unwrap();
    let readable = device
        .create_buffer(BufferDesc::new(64, BufferUsage::VERTEX | BufferUsage::COPY_SRC).dynamic(), None)
        .unwrap();
    device.map_write(readable, 0, &[3; 8], WriteMode::Discard).unwrap();

    assert!(matches!(device.read_back(vertices, 0, 4), Err(GpuError::InvalidConfig(_))));
    assert!(matches!(device.read_back(sprites, 0, 4), Err(GpuError::InvalidConfig(_))));
    assert_eq!(device.read_back(readable, 0, 8).unwrap(), [3; 8]);
}

// ── device loss ───────────────────────────────────────────────────────────

#[test]
fn device_loss_is_reported_once_and_stops_gpu_work() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    device.set_device_lost_callback(move |err| {
        assert!(err.is_device_lost());
        seen.fetch_add(1, Ordering::SeqCst);
    });

    empty_frame(&mut device);
    device.begin_frame().unwrap();
    backend.lose_device("removed");
    assert!(device.present(1).unwrap_err().is_device_lost());
    assert!(device.is_lost());
    assert!(!device.is_recording());

    assert!(device.begin_frame().unwrap_err().is_device_lost());
    assert!(device.create_texture(TextureDesc::new_2d(4, 4, Format::Rgba8Unorm, TextureUsage::SAMPLED)).is_err());
    assert!(device.wait_for_gpu().is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_present_still_retires_the_frame() {
    let (backend, mut device) = device(CompletionMode::Immediate);
    let buffer = device
        .create_buffer(BufferDesc::new(128, BufferUsage::VERTEX).dynamic(), None)
        .unwrap();

    device.begin_frame().unwrap();
    let stamp = device.frame;
    let retired = device.buffer(buffer).unwrap().allocation().id();
    device.map_write(buffer, 0, &[1; 128], WriteMode::Discard).unwrap();
    backend.fail_next_present("swap chain out of date");
    assert!(matches!(device.present(1), Err(GpuError::Backend(_))));

    assert!(!device.is_lost());
    assert!(!device.is_recording());
    assert_ne!(device.frame, stamp);
    assert!(device.buffer_pools.get(BufferClass::Vertex).is_pending(retired));
    assert_eq!(device.stats().frames_presented, 0);

    empty_frame(&mut device);
    assert_eq!(device.stats().frames_presented, 1);
}

#[test]
fn teardown_frees_everything() {
    let (backend, mut device) = device(CompletionMode::Lag(1));
    bind_shaders(&mut device);
    let buffer = device
        .create_buffer(BufferDesc::new(128, BufferUsage::VERTEX).dynamic(), None)
        .unwrap();
    let doomed = device
        .create_texture(TextureDesc::new_2d(4, 4, Format::Rgba8Unorm, TextureUsage::SAMPLED))
        .unwrap();
    for _ in 0..3 {
        device.begin_frame().unwrap();
        device.map_write(buffer, 0, &[1; 128], WriteMode::Discard).unwrap();
        device.present(1).unwrap();
    }
    device.destroy_texture(doomed).unwrap();
    drop(device);

    let stats = backend.stats();
    assert_eq!(stats.live_buffers(), 0);
    assert_eq!(stats.live_textures(), 0);
}
