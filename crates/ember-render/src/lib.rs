// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

pub mod vertex;

pub use vertex::{BufferVertexConsumer, VertexConsumer, VertexError, VertexFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearColor(pub [f32; 4]);

impl ClearColor {
    pub const fn rgb(r: f32, g: f32, b: f32) -> Self {
        ClearColor([r, g, b, 1.0])
    }
}

impl Default for ClearColor {
    fn default() -> Self {
        ClearColor([0.3, 0.3, 0.3, 1.0])
    }
}

/// What the frame loop needs from the window it presents into.
pub trait WindowSurface {
    /// Current framebuffer size in pixels. 0x0 while minimized.
    fn framebuffer_size(&self) -> RenderSize;
    /// Blocks until the platform has had a chance to deliver new events.
    fn wait_events(&self);
}

impl<S: WindowSurface + ?Sized> WindowSurface for Arc<S> {
    fn framebuffer_size(&self) -> RenderSize {
        (**self).framebuffer_size()
    }

    fn wait_events(&self) {
        (**self).wait_events()
    }
}

/// A window a backend can create a presentation surface for.
pub trait PresentTarget: WindowSurface + HasWindowHandle + HasDisplayHandle {}

impl<T: WindowSurface + HasWindowHandle + HasDisplayHandle> PresentTarget for T {}

pub trait Renderer {
    fn new<T: PresentTarget + 'static>(target: Arc<T>) -> Result<Self>
    where
        Self: Sized;

    /// Records a window resize. The swapchain is rebuilt at the next frame boundary.
    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
    /// Waits for the device to go idle and releases everything the renderer owns.
    fn shutdown(&mut self) -> Result<()>;
}
