// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use ember_render::RenderSize;
use tracing::info;

use crate::error::{DeviceContext, FrameError, FrameResult};
use crate::gpu::{DepthAttachment, Gpu, SwapchainRequest, VsyncMode};
use crate::providers::RenderTarget;

/// Build generation of the swapchain and everything derived from it.
/// The first build is epoch 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const FIRST: Epoch = Epoch(1);

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfig {
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            vsync_mode: VsyncMode::default(),
        }
    }
}

/// Surface extent to build with. Follows the window when the surface leaves
/// the extent undefined.
pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means "no max").
pub fn image_count_from_caps(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

/// The image chain and every object sized or counted by it.
///
/// `images`, `views` and `framebuffers` always have the same length.
#[derive(Debug)]
pub struct SwapchainResources {
    epoch: Epoch,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    depth: DepthAttachment,
    framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainResources {
    /// `desired` must be non-zero; the caller waits out minimized windows.
    pub fn build<G: Gpu>(
        gpu: &G,
        desired: RenderSize,
        config: SwapchainConfig,
        epoch: Epoch,
    ) -> FrameResult<Self> {
        if desired.is_zero() {
            return Err(FrameError::invariant(format!(
                "swapchain build requested for {}x{}",
                desired.width, desired.height
            )));
        }

        let caps = gpu
            .surface_capabilities()
            .device("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let extent = extent_from_caps(&caps, desired);
        let image_count = image_count_from_caps(&caps);

        let created = gpu
            .create_swapchain(&SwapchainRequest {
                image_count,
                extent,
                vsync: config.vsync,
                vsync_mode: config.vsync_mode,
            })
            .device("vkCreateSwapchainKHR")?;

        // Owns every object created from here on; `free` handles a partial build.
        let mut this = Self {
            epoch,
            handle: created.handle,
            format: created.format,
            present_mode: created.present_mode,
            extent,
            images: Vec::new(),
            views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            depth: DepthAttachment::default(),
            framebuffers: Vec::new(),
        };
        if let Err(e) = this.populate(gpu) {
            this.free(gpu, |_| {});
            return Err(e);
        }

        info!(
            epoch = epoch.0,
            images = this.images.len(),
            "swapchain built: {}x{} format={:?} present_mode={:?}",
            extent.width,
            extent.height,
            this.format,
            this.present_mode
        );
        Ok(this)
    }

    fn populate<G: Gpu>(&mut self, gpu: &G) -> FrameResult<()> {
        self.images = gpu
            .swapchain_images(self.handle)
            .device("vkGetSwapchainImagesKHR")?;
        for &image in &self.images {
            let view = gpu
                .create_color_view(image, self.format)
                .device("vkCreateImageView")?;
            self.views.push(view);
        }

        let depth_format = gpu.depth_format();
        self.render_pass = gpu
            .create_render_pass(self.format, depth_format)
            .device("vkCreateRenderPass")?;
        self.depth = gpu
            .create_depth_attachment(self.extent, depth_format)
            .device("create depth attachment")?;

        for &view in &self.views {
            let framebuffer = gpu
                .create_framebuffer(self.render_pass, &[view, self.depth.view], self.extent)
                .device("vkCreateFramebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Destroys everything, after `release_dependents` has released the
    /// objects built on top of this swapchain (uniform descriptor pools, then
    /// command buffers). The device must be idle.
    pub fn free<G: Gpu>(self, gpu: &G, release_dependents: impl FnOnce(&G)) {
        // STRICT TEARDOWN ORDER:
        // 1) dependents (descriptor pools, command buffers)
        release_dependents(gpu);
        // 2) depth attachment
        if self.depth.image != vk::Image::null() {
            gpu.destroy_depth_attachment(&self.depth);
        }
        // 3) framebuffers, before the render pass they reference
        for &framebuffer in &self.framebuffers {
            gpu.destroy_framebuffer(framebuffer);
        }
        // 4) render pass
        if self.render_pass != vk::RenderPass::null() {
            gpu.destroy_render_pass(self.render_pass);
        }
        // 5) image views
        for &view in &self.views {
            gpu.destroy_image_view(view);
        }
        // 6) the chain itself; its images go with it
        gpu.destroy_swapchain(self.handle);
    }

    /// `free` followed by `build` at the next epoch.
    pub fn rebuild<G: Gpu>(
        self,
        gpu: &G,
        desired: RenderSize,
        config: SwapchainConfig,
        release_dependents: impl FnOnce(&G),
    ) -> FrameResult<Self> {
        let epoch = self.epoch.next();
        self.free(gpu, release_dependents);
        Self::build(gpu, desired, config, epoch)
    }

    pub fn render_target(&self) -> RenderTarget {
        RenderTarget {
            render_pass: self.render_pass,
            extent: self.extent,
            color_format: self.format,
            epoch: self.epoch,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn depth(&self) -> &DepthAttachment {
        &self.depth
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }
}
