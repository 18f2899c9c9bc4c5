use std::time::Instant;

use anyhow::{bail, Context};
use ash::vk;
use ash_renderer::{
    config::RendererConfig,
    engine::lin_alg::{Matrix4, Vector2, Vector3, Vector4},
    logging::{init_logging, LoggingConfig},
    renderer::{
        base::VulkanDevice,
        device::GpuDevice,
        headless::HeadlessDevice,
        runtime::{
            resources::{mesh::VertexBlob, AssetHandle},
            Renderer,
        },
        utilities::{AssetCategory, DeviceLimits},
        RendererError,
    },
};
use bytemuck::{Pod, Zeroable};
use log::{error, info, warn};
use winit::{
    dpi::LogicalSize,
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    platform::run_return::EventLoopExtRunReturn,
    window::WindowBuilder,
};

const DEFAULT_HEADLESS_FRAMES: u32 = 120;

/// Uniform block of 2D and UI assets.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FlatUniform {
    rows: [Vector4<f32>; 3],
    color: Vector4<f32>,
}

/// Uniform block of 3D assets.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SpatialUniform {
    model: Matrix4<f32>,
    color: Vector4<f32>,
    material: Vector4<f32>,
    flags: [i32; 4],
}

fn flat_transform(offset: Vector2<f32>, scale: f32, color: Vector4<f32>) -> FlatUniform {
    FlatUniform {
        rows: [
            Vector4::new(scale, 0.0, offset.x, 0.0),
            Vector4::new(0.0, scale, offset.y, 0.0),
            Vector4::new(0.0, 0.0, 1.0, 0.0),
        ],
        color,
    }
}

struct Args {
    headless: bool,
    frames: u32,
    config: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        headless: false,
        frames: DEFAULT_HEADLESS_FRAMES,
        config: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--headless" => args.headless = true,
            "--frames" => {
                let value = iter.next().context("--frames needs a value")?;
                args.frames = value
                    .parse()
                    .with_context(|| format!("invalid frame count {value:?}"))?;
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            path => args.config = Some(path.to_owned()),
        }
    }
    Ok(args)
}

/// Demo scene: a textured quad and a bobbing triangle, with a
/// UI panel on top.
struct Scene {
    quad: AssetHandle,
    triangle: AssetHandle,
    panel: AssetHandle,
    started: Instant,
}

impl Scene {
    fn submit<D: GpuDevice>(renderer: &mut Renderer<D>) -> anyhow::Result<Self> {
        let (width, height) = (128, 128);
        let pixels: Vec<u8> = (0..width * height)
            .flat_map(|i| {
                let (x, y) = (i % width, i / width);
                [(x * 2) as u8, (y * 2) as u8, 160, 255]
            })
            .collect();
        let texture = renderer
            .submit_texture(&pixels, width, height)
            .context("uploading the demo texture")?;

        let quad_blob = VertexBlob::flat(vec![
            Vector2::new(-0.5, -0.5),
            Vector2::new(0.5, -0.5),
            Vector2::new(0.5, 0.5),
            Vector2::new(-0.5, 0.5),
        ])
        .with_texcoords(vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.0, 1.0),
        ]);
        let quad_indices = [0, 1, 2, 2, 3, 0];
        let quad = renderer.submit_asset(
            &quad_blob,
            &quad_indices,
            AssetCategory::Mapped2D,
            Some(texture),
        )?;

        let triangle = renderer.submit_asset(
            &VertexBlob::spatial(vec![
                Vector3::new(0.0, -0.5, 0.0),
                Vector3::new(0.5, 0.5, 0.0),
                Vector3::new(-0.5, 0.5, 0.0),
            ])
            .with_normals(vec![Vector3::new(0.0, 0.0, -1.0); 3]),
            &[0, 1, 2],
            AssetCategory::Unmapped3D,
            None,
        )?;

        // No texture: the panel samples the missing-texture checkerboard.
        let panel = renderer.submit_asset(&quad_blob, &quad_indices, AssetCategory::Ui, None)?;

        let scene = Self {
            quad,
            triangle,
            panel,
            started: Instant::now(),
        };
        scene.update(renderer)?;
        Ok(scene)
    }

    fn update<D: GpuDevice>(&self, renderer: &mut Renderer<D>) -> Result<(), RendererError> {
        let t = self.started.elapsed().as_secs_f32();

        let quad = flat_transform(
            Vector2::new(-0.4, 0.0),
            0.6,
            Vector4::new(1.0, 1.0, 1.0, 1.0),
        );
        renderer.update_uniform(self.quad, 0, bytemuck::bytes_of(&quad))?;

        let triangle = SpatialUniform {
            model: Matrix4::translation(Vector3::new(0.5, (t * 2.0).sin() * 0.2, 0.5)),
            color: Vector4::new(0.9, 0.4, 0.2, 1.0),
            material: Vector4::new(0.5, 0.0, 0.0, 0.0),
            flags: [0; 4],
        };
        renderer.update_uniform(self.triangle, 0, bytemuck::bytes_of(&triangle))?;

        let panel = flat_transform(
            Vector2::new(0.0, -0.85),
            0.25,
            Vector4::new(1.0, 1.0, 1.0, 0.7),
        );
        renderer.update_uniform(self.panel, 0, bytemuck::bytes_of(&panel))
    }
}

fn log_stats<D: GpuDevice>(renderer: &Renderer<D>) {
    match serde_json::to_string_pretty(&renderer.stats()) {
        Ok(stats) => info!("Renderer stats:\n{stats}"),
        Err(e) => warn!("Failed to serialize renderer stats: {e}"),
    }
}

fn run_headless(config: &RendererConfig, frames: u32) -> anyhow::Result<()> {
    let device = HeadlessDevice::new(DeviceLimits::default(), config.frame_count());
    let mut renderer = Renderer::new(device, config)?;
    let scene = Scene::submit(&mut renderer)?;

    for _ in 0..frames {
        renderer.draw_with(|renderer| scene.update(renderer))?;
    }

    info!(
        "Rendered {frames} headless frames, {} recordings",
        renderer.device().stats().recordings
    );
    log_stats(&renderer);
    Ok(())
}

fn run_windowed(config: &RendererConfig) -> anyhow::Result<()> {
    let mut event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("ash-renderer")
        .with_inner_size(LogicalSize::new(800, 800))
        .build(&event_loop)
        .context("Failed to create window")?;

    let device = VulkanDevice::new(&window, config)?;
    let mut renderer = Renderer::new(device, config)?;
    let scene = Scene::submit(&mut renderer)?;
    let mut fatal = None;

    event_loop.run_return(|event, _, control_flow| {
        control_flow.set_poll();
        match event {
            Event::WindowEvent { event: e, .. } => match e {
                WindowEvent::CloseRequested => control_flow.set_exit(),
                WindowEvent::Resized(size) => renderer.on_window_resized(vk::Extent2D {
                    width: size.width,
                    height: size.height,
                }),
                _ => (),
            },
            Event::RedrawEventsCleared => {
                let result = renderer.draw_with(|renderer| scene.update(renderer));
                match result {
                    Ok(_) => (),
                    Err(e) if e.is_fatal() => {
                        error!("Fatal renderer error: {e}");
                        fatal = Some(e);
                        control_flow.set_exit();
                    }
                    Err(e) => warn!("Frame failed: {e}"),
                }
            }
            _ => (),
        }
    });

    log_stats(&renderer);
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => RendererConfig::load(path)?,
        None => RendererConfig::default(),
    };

    init_logging(LoggingConfig {
        env_filter: config.log_filter.clone(),
        ..Default::default()
    });

    if args.headless {
        run_headless(&config, args.frames)
    } else {
        run_windowed(&config)
    }
}
