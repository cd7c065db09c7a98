// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use ember_core::init_tracing;
use ember_platform::PlatformWindow;
use ember_render::{RenderSize, Renderer};
use ember_render_vk::{VkRenderer, VsyncMode};
use tracing::{error, info, warn};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

mod config;
mod demo;

use config::{AppCfg, Args, UnfocusedPolicy};
use demo::Demo;

struct App {
    window: Option<Arc<PlatformWindow>>,
    renderer: Option<VkRenderer>,
    demo: Option<Demo>,
    render_size: RenderSize,

    cfg: AppCfg,
    exiting: bool,
    started: Instant,
    frames: u32,
    last_fps_instant: Instant,

    paused: bool,
    focused: bool,
    next_frame_deadline: Option<Instant>,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let now = Instant::now();
        App {
            window: None,
            renderer: None,
            demo: None,
            render_size: RenderSize {
                width: 1,
                height: 1,
            },
            cfg,
            exiting: false,
            started: now,
            frames: 0,
            last_fps_instant: now,
            paused: false,
            focused: true,
            next_frame_deadline: None,
        }
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(PlatformWindow::create(event_loop, "ember")?);
        self.render_size = window.inner_size();

        let mut renderer = VkRenderer::new(window.clone())?;
        renderer.set_clear_color(self.cfg.render.clear_color);
        renderer.set_vsync(self.cfg.render.vsync);
        renderer.set_vsync_mode(self.cfg.render.vsync_mode.into())?;
        self.demo = Some(Demo::spawn(&mut renderer)?);

        info!("vsync cfg = {}", self.cfg.render.vsync);
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Releases scene geometry, then the renderer, then the window.
    fn stop(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Some(demo) = self.demo.take() {
                demo.despawn(&mut renderer);
            }
            if let Err(e) = renderer.shutdown() {
                error!("renderer shutdown: {e:#}");
            }
        }
        self.window = None;
    }

    fn request_redraw(&self) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn apply_focus_policy(&mut self, focused: bool) {
        let Some(renderer) = &mut self.renderer else {
            return;
        };
        if self.cfg.render.unfocused != UnfocusedPolicy::VsyncOn {
            return;
        }
        let (vsync, mode) = if focused {
            (self.cfg.render.vsync, self.cfg.render.vsync_mode.into())
        } else {
            (true, VsyncMode::Fifo)
        };
        renderer.set_vsync(vsync);
        if let Err(e) = renderer.set_vsync_mode(mode) {
            error!("set_vsync_mode: {e:#}");
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                error!("vk init failed: {e:#}");
                self.stop();
                self.exiting = true;
                event_loop.exit();
                return;
            }
        }

        event_loop.set_control_flow(if self.cfg.render.vsync {
            ControlFlow::Wait
        } else {
            ControlFlow::Poll
        });

        self.paused = self.render_size.is_zero();
        info!("resumed → paused={}", self.paused);

        if !self.paused {
            self.request_redraw();
        }
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
                self.exiting = true;
                self.stop();
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                self.paused = self.render_size.is_zero();
                info!(
                    "Resized → {}x{} (paused={})",
                    self.render_size.width, self.render_size.height, self.paused
                );

                if !self.paused {
                    if let Some(renderer) = &mut self.renderer {
                        if let Err(e) = renderer.resize(self.render_size) {
                            warn!("resize: {e:#}");
                        }
                    }
                    self.request_redraw();
                }
            }

            WindowEvent::Occluded(occluded) => {
                let now_paused = occluded || self.render_size.is_zero();
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!("Occluded={} → paused={}", occluded, self.paused);
                }
            }

            WindowEvent::Focused(focused) => {
                if self.focused != focused {
                    self.focused = focused;
                    info!("Focused({})", focused);
                    self.apply_focus_policy(focused);
                    if focused {
                        self.next_frame_deadline = None;
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }

                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                let seconds = self.started.elapsed().as_secs_f32();
                renderer
                    .camera()
                    .set(demo::camera(seconds, self.render_size));

                match renderer.render() {
                    // count only frames that were actually rendered
                    Ok(()) => self.frames = self.frames.saturating_add(1),
                    Err(e) => {
                        // The frame loop is poisoned after any render error.
                        error!("render error: {e:#}");
                        self.exiting = true;
                        self.stop();
                        event_loop.exit();
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // minimized or occluded → sleep
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        // 0 means "no cap here"
        let mut target_fps: u32 = 0;
        if !self.focused && self.cfg.render.unfocused == UnfocusedPolicy::Throttle {
            target_fps = self.cfg.render.unfocused_fps;
        }

        if target_fps == 0 {
            if self.cfg.render.vsync {
                // Present blocks on vsync; redraw once per wakeup
                event_loop.set_control_flow(ControlFlow::Wait);
                self.request_redraw();
            } else {
                target_fps = self.cfg.render.fps_when_vsync_off;
                if target_fps == 0 {
                    event_loop.set_control_flow(ControlFlow::Poll);
                    self.request_redraw();
                }
            }
        }

        if target_fps > 0 {
            let now = Instant::now();
            match self.next_frame_deadline {
                Some(deadline) if now < deadline => {
                    // Not time yet: sleep until the stored deadline.
                    event_loop.set_control_flow(ControlFlow::WaitUntil(deadline));
                }
                _ => {
                    let next = now + Duration::from_nanos(1_000_000_000 / target_fps as u64);
                    self.next_frame_deadline = Some(next);
                    event_loop.set_control_flow(ControlFlow::WaitUntil(next));
                    self.request_redraw();
                }
            }
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            if let Some(renderer) = &self.renderer {
                let stats = renderer.frame_stats();
                info!(
                    "fps ~ {} (rebuilds {}, records {})",
                    self.frames, stats.rebuilds, stats.records
                );
            }
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.stop();
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = AppCfg::load(&args.config);
    cfg.apply(&args);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
