use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};

use kiln_core::backend::headless::{CompletionMode, HeadlessBackend};
use kiln_core::device::{ClearFlags, WriteMode};
use kiln_core::format::{Format, IndexFormat, ShaderStage, VertexFormat};
use kiln_core::logging::{init_logging, LoggingConfig};
use kiln_core::pipeline::{BlendState, VertexAttribute, VertexBufferLayout, VertexLayout, VertexStepMode};
use kiln_core::resource::{BufferDesc, BufferUsage, SamplerDesc, ShaderDesc, TextureDesc, TextureRegion, TextureUsage};
use kiln_core::{Device, DeviceConfig};

const DEFAULT_FRAMES: u64 = 300;
const DEFAULT_LAG: u64 = 1;
const SPRITES: usize = 64;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct Sprite {
    offset: [f32; 2],
    scale: f32,
    rotation: f32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct FrameUniforms {
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

const QUAD: [Vertex; 4] = [
    Vertex { position: [-0.5, -0.5], uv: [0.0, 1.0] },
    Vertex { position: [0.5, -0.5], uv: [1.0, 1.0] },
    Vertex { position: [0.5, 0.5], uv: [1.0, 0.0] },
    Vertex { position: [-0.5, 0.5], uv: [0.0, 0.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

/// `kiln-studio [frames] [gpu-lag]`
fn parse_args() -> Result<(u64, u64)> {
    let mut args = std::env::args().skip(1);
    let frames = match args.next() {
        Some(arg) => arg.parse().with_context(|| format!("invalid frame count {arg:?}"))?,
        None => DEFAULT_FRAMES,
    };
    let lag = match args.next() {
        Some(arg) => arg.parse().with_context(|| format!("invalid gpu lag {arg:?}"))?,
        None => DEFAULT_LAG,
    };
    Ok((frames, lag))
}

fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x / 4 + y / 4) % 2 == 0 {
                [0xFF, 0xFF, 0xFF, 0xFF]
            } else {
                [0x20, 0x20, 0x20, 0xFF]
            }
        })
        .collect()
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let (frames, lag) = parse_args()?;

    let backend = Arc::new(HeadlessBackend::new(CompletionMode::Lag(lag)));
    let config = DeviceConfig {
        width: 640,
        height: 360,
        ..DeviceConfig::default()
    };
    let mut device = Device::new(Arc::clone(&backend), config).context("failed to create device")?;
    device.set_device_lost_callback(|err| log::error!("device lost: {err}"));

    // ── static resources ──────────────────────────────────────────────────

    let quad = device.create_buffer(
        BufferDesc::new(size_of_val(&QUAD) as u64, BufferUsage::VERTEX | BufferUsage::COPY_SRC).with_label("quad"),
        Some(bytemuck::cast_slice(&QUAD)),
    )?;
    let indices = device.create_buffer(
        BufferDesc::new(size_of_val(&QUAD_INDICES) as u64, BufferUsage::INDEX).with_label("quad indices"),
        Some(bytemuck::cast_slice(&QUAD_INDICES)),
    )?;
    let sprites = device.create_buffer(
        BufferDesc::new((SPRITES * size_of::<Sprite>()) as u64, BufferUsage::VERTEX)
            .with_label("sprites")
            .dynamic(),
        None,
    )?;

    let atlas = device.create_texture(
        TextureDesc::new_2d(64, 64, Format::Rgba8Unorm, TextureUsage::SAMPLED | TextureUsage::COPY_DST)
            .with_label("atlas"),
    )?;
    let atlas_region = TextureRegion::full(device.texture(atlas).context("atlas was just created")?.desc());
    device.texture_set_data(atlas, atlas_region, &checkerboard(64))?;
    let sampler = device.create_sampler(&SamplerDesc::default())?;

    // The headless backend treats bytecode as opaque.
    let vs = device.create_shader(&ShaderDesc::new(ShaderStage::Vertex, "vs_main", b"sprite.vs".to_vec()))?;
    let fs = device.create_shader(&ShaderDesc::new(ShaderStage::Fragment, "fs_main", b"sprite.fs".to_vec()))?;

    let layout = device.create_input_layout(VertexLayout::new(
        vec![
            VertexAttribute { location: 0, slot: 0, format: VertexFormat::Float32x2, offset: 0 },
            VertexAttribute { location: 1, slot: 0, format: VertexFormat::Float32x2, offset: 8 },
            VertexAttribute { location: 2, slot: 1, format: VertexFormat::Float32x4, offset: 0 },
        ],
        vec![
            VertexBufferLayout { stride: size_of::<Vertex>() as u32, step: VertexStepMode::Vertex },
            VertexBufferLayout { stride: size_of::<Sprite>() as u32, step: VertexStepMode::Instance },
        ],
    )?);
    let blend = device.create_blend_state(BlendState::ALPHA_BLENDING);

    // ── frame loop ────────────────────────────────────────────────────────

    let started = Instant::now();
    for frame in 0..frames {
        device.begin_frame()?;
        device.clear(ClearFlags::all(), [0.05, 0.05, 0.08, 1.0], 1.0, 0)?;

        let t = frame as f32 / 60.0;
        let instances: Vec<Sprite> = (0..SPRITES)
            .map(|i| {
                let phase = t + i as f32 * 0.1;
                Sprite {
                    offset: [phase.cos() * 0.8, phase.sin() * 0.8],
                    scale: 0.05,
                    rotation: phase,
                }
            })
            .collect();
        device.map_write(sprites, 0, bytemuck::cast_slice(&instances), WriteMode::Discard)?;

        let uniforms = FrameUniforms {
            time: t,
            frame: frame as u32,
            _pad: [0; 2],
        };
        device.set_uniform_data(ShaderStage::Vertex, 0, bytemuck::bytes_of(&uniforms))?;

        device.set_shaders(vs, Some(fs));
        device.set_input_layout(Arc::clone(&layout));
        device.set_blend_state(Arc::clone(&blend));
        device.set_vertex_buffer(0, Some(quad), 0);
        device.set_vertex_buffer(1, Some(sprites), 0);
        device.set_index_buffer(Some(indices), 0, IndexFormat::Uint16);
        device.set_texture(0, Some(atlas));
        device.set_sampler(0, Some(sampler));
        device.draw_indexed(QUAD_INDICES.len() as u32, SPRITES as u32, 0, 0, 0)?;

        // Churn a transient render target to exercise deferred destruction.
        if frame % 50 == 25 {
            let scratch = device.create_texture(TextureDesc::new_2d(
                128,
                128,
                Format::Rgba8Unorm,
                TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
            ))?;
            device.destroy_texture(scratch)?;
        }

        device.present(1)?;
    }
    device.wait_for_gpu()?;
    let elapsed = started.elapsed();

    let check = device.read_back(quad, 0, size_of_val(&QUAD) as u64)?;
    anyhow::ensure!(check == bytemuck::cast_slice::<_, u8>(&QUAD), "quad buffer read back corrupted");

    // ── report ────────────────────────────────────────────────────────────

    let stats = device.stats();
    let native = backend.stats();
    log::info!("{frames} frames in {elapsed:?} with the GPU {lag} frame(s) behind");
    println!();
    println!("  frames presented      {}", stats.frames_presented);
    println!("  blocking waits        {}", stats.blocking_waits);
    println!("  draws                 {}", stats.draws);
    println!(
        "  pipelines             {} built, {} hits, {} collisions",
        stats.pipelines.builds, stats.pipelines.hits, stats.pipelines.collisions
    );
    println!("  command allocators    {}", stats.command_allocators);
    println!("  command lists         {}", stats.command_lists);
    println!(
        "  pooled buffers        {} (peak {}, {} allocations)",
        stats.pooled_buffers, stats.peak_pooled_buffers, stats.pool_allocations
    );
    println!("  reclaimed objects     {}", stats.reclaimed);
    println!("  pending destroys      {}", device.pending_destroys());
    println!(
        "  native                {} submissions, {} barrier calls, {} live buffers",
        native.submissions,
        native.barrier_calls,
        native.live_buffers()
    );
    println!();
    Ok(())
}
