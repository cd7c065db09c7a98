// SPDX-License-Identifier: CEPL-1.0
//! winit-backed window provider.

use std::time::Duration;

use anyhow::{Context, Result};
use ember_render::{RenderSize, WindowSurface};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use tracing::trace;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

pub use winit;

/// How long [`WindowSurface::wait_events`] parks the render thread.
const EVENT_WAIT: Duration = Duration::from_millis(16);

pub struct PlatformWindow {
    window: Window,
}

impl PlatformWindow {
    pub fn create(event_loop: &ActiveEventLoop, title: &str) -> Result<Self> {
        let window = event_loop
            .create_window(Window::default_attributes().with_title(title))
            .context("create_window")?;
        Ok(Self { window })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn inner_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize {
            width: size.width,
            height: size.height,
        }
    }
}

impl WindowSurface for PlatformWindow {
    fn framebuffer_size(&self) -> RenderSize {
        self.inner_size()
    }

    /// The event loop lives on the caller's stack, so this only yields and
    /// lets the compositor settle. The app stops rendering while the window
    /// is minimized, which keeps this off the common path.
    fn wait_events(&self) {
        trace!("waiting for a non-zero framebuffer");
        std::thread::sleep(EVENT_WAIT);
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}
