// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ember_core::init_tracing;
use ember_render::{PresentMode, RenderDevice, RenderError, RenderSize, SurfaceId, SurfacePreferences};
use ember_render_vk::{DeviceConfig, VkRenderDevice};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::HasDisplayHandle,
    window::{Window, WindowId},
};

mod scene;
use scene::Scene;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with `[app]` and `[device]` tables
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Exit after this many presented frames (0 = run until closed)
    #[arg(long, default_value_t = 0)]
    frames: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum PresentModeCfg {
    Fifo,
    #[default]
    Mailbox,
    Immediate,
}

impl From<PresentModeCfg> for PresentMode {
    fn from(m: PresentModeCfg) -> Self {
        match m {
            PresentModeCfg::Fifo => PresentMode::Fifo,
            PresentModeCfg::Mailbox => PresentMode::Mailbox,
            PresentModeCfg::Immediate => PresentMode::Immediate,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
struct AppCfg {
    title: String,
    width: u32,
    height: u32,
    clear_color: [f32; 4],
    present_mode: PresentModeCfg,
}

impl Default for AppCfg {
    fn default() -> Self {
        AppCfg {
            title: "ember".to_owned(),
            width: 1280,
            height: 720,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            present_mode: PresentModeCfg::Mailbox,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileCfg {
    app: AppCfg,
    device: DeviceConfig,
}

/// A missing file means defaults; a malformed one is an error.
fn load_cfg(path: &Path) -> Result<FileCfg> {
    let mut cfg = match std::fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).with_context(|| format!("parsing {}", path.display()))?,
        Err(_) => {
            info!("{} not found; using defaults", path.display());
            FileCfg::default()
        }
    };
    cfg.device = cfg.device.apply_env().validated();
    Ok(cfg)
}

fn parse_cfg(s: &str) -> Result<FileCfg> {
    Ok(toml::from_str::<FileCfg>(s)?)
}

/// Live GPU state; dropped together, scene first.
struct Gpu {
    scene: Option<Scene>,
    surface: SurfaceId,
    device: VkRenderDevice,
}

impl Gpu {
    fn new(window: &Window, cfg: &FileCfg) -> Result<Self> {
        let display = window.display_handle()?.as_raw();
        let mut device = VkRenderDevice::new(Some(display), cfg.device.clone())
            .context("creating vulkan device")?;
        info!(
            "device: {} ({})",
            device.device_name(),
            device.vendor_name()
        );

        let size = window.inner_size();
        let prefs = SurfacePreferences {
            present_mode: cfg.app.present_mode.into(),
            ..SurfacePreferences::default()
        };
        let surface = device
            .create_surface(
                window,
                window,
                RenderSize {
                    width: size.width,
                    height: size.height,
                },
                &prefs,
            )
            .context("creating window surface")?;
        let scene = Scene::new(&mut device, surface, cfg.app.clear_color)?;
        Ok(Self {
            scene: Some(scene),
            surface,
            device,
        })
    }

    fn shutdown(mut self) -> Result<()> {
        self.device.wait_idle()?;
        if let Some(scene) = self.scene.take() {
            scene.destroy(&mut self.device)?;
        }
        self.device.destroy_surface(self.surface)?;
        Ok(())
    }
}

struct App {
    args: Args,
    cfg: FileCfg,
    window: Option<Window>,
    gpu: Option<Gpu>,
    failure: Option<anyhow::Error>,

    paused: bool,
    started: Instant,
    presented: u64,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(args: Args, cfg: FileCfg) -> Self {
        let now = Instant::now();
        App {
            args,
            cfg,
            window: None,
            gpu: None,
            failure: None,
            paused: false,
            started: now,
            presented: 0,
            frames: 0,
            last_fps_instant: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.failure.get_or_insert(e);
        self.teardown();
        event_loop.exit();
    }

    fn teardown(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            if let Err(e) = gpu.shutdown() {
                error!("shutdown: {e:#}");
                self.failure.get_or_insert(e);
            }
        }
        self.window = None;
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> Result<()> {
        self.paused = size.width == 0 || size.height == 0;
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };
        gpu.device.resize_surface(
            gpu.surface,
            RenderSize {
                width: size.width,
                height: size.height,
            },
        )?;
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };
        let Some(scene) = gpu.scene.as_ref() else {
            return Ok(());
        };
        let t = self.started.elapsed().as_secs_f32();
        match scene.render(&mut gpu.device, t) {
            Ok(()) => {
                self.presented += 1;
                self.frames = self.frames.saturating_add(1);
                Ok(())
            }
            Err(RenderError::SwapchainOutOfDate) => {
                let size = self
                    .window
                    .as_ref()
                    .map(|w| w.inner_size())
                    .ok_or_else(|| anyhow!("window gone"))?;
                warn!("swapchain out of date; resizing to {}x{}", size.width, size.height);
                self.resize(size)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title(self.cfg.app.title.clone())
            .with_inner_size(PhysicalSize::new(self.cfg.app.width, self.cfg.app.height));
        let window = match event_loop.create_window(attrs) {
            Ok(w) => w,
            Err(e) => return self.fail(event_loop, anyhow!(e).context("create_window")),
        };
        match Gpu::new(&window, &self.cfg) {
            Ok(gpu) => self.gpu = Some(gpu),
            Err(e) => return self.fail(event_loop, e),
        }
        self.window = Some(window);

        event_loop.set_control_flow(if self.cfg.device.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });
        info!("resumed; vsync = {}", self.cfg.device.vsync);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.teardown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                info!("Resized → {}x{}", size.width, size.height);
                if let Err(e) = self.resize(size) {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.paused {
                    return;
                }
                if let Err(e) = self.redraw() {
                    return self.fail(event_loop, e);
                }
                if self.args.frames != 0 && self.presented >= self.args.frames {
                    info!("presented {} frame(s); exiting", self.presented);
                    self.teardown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.paused {
            self.frames = 0;
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing("info");
    let args = Args::parse();
    let cfg = load_cfg(&args.config)?;
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App::new(args, cfg);
    event_loop.run_app(&mut app)?;
    app.teardown();
    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let cfg = parse_cfg(
            r#"
            [app]
            title = "demo"
            width = 640
            height = 480
            clear_color = [0.1, 0.2, 0.3, 1.0]
            present_mode = "fifo"

            [device]
            validation = false
            frames_in_flight = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.app.title, "demo");
        assert_eq!((cfg.app.width, cfg.app.height), (640, 480));
        assert_eq!(cfg.app.present_mode, PresentModeCfg::Fifo);
        assert!(!cfg.device.validation);
        assert_eq!(cfg.device.frames_in_flight, 3);
        assert_eq!(cfg.device.descriptor_pool_initial_size, 16);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg.app, AppCfg::default());
        assert_eq!(cfg.device, DeviceConfig::default());
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(parse_cfg("[app]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_cfg(Path::new("/nonexistent/ember.toml")).unwrap();
        assert_eq!(cfg.app, AppCfg::default());
    }

    #[test]
    fn present_modes_map_through() {
        assert_eq!(PresentMode::from(PresentModeCfg::Immediate), PresentMode::Immediate);
        assert_eq!(PresentMode::from(PresentModeCfg::default()), PresentMode::Mailbox);
    }
}
