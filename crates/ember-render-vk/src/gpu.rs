// SPDX-License-Identifier: CEPL-1.0
//! The device seam. Everything the frame loop asks of Vulkan goes through
//! [`Gpu`], so the loop itself can run against a recording device in tests.

use ash::prelude::VkResult;
use ash::vk;
use ember_render::ClearColor;

use crate::scene::RenderInfo;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    Fifo,    // Target monitor refresh rate
    #[default]
    Mailbox, // Smart Vsync, fps uncapped
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainRequest {
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
}

#[derive(Clone, Copy, Debug)]
pub struct CreatedSwapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DepthAttachment {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// One queue submission of a pre-recorded command buffer.
#[derive(Clone, Copy, Debug)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal: vk::Semaphore,
    pub fence: vk::Fence,
}

pub trait Gpu {
    // --- synchronization ---
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Blocks until `fence` is signaled.
    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn wait_idle(&self) -> VkResult<()>;

    // --- swapchain-scoped objects ---
    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn create_swapchain(&self, request: &SwapchainRequest) -> VkResult<CreatedSwapchain>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn create_color_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn depth_format(&self) -> vk::Format;
    fn create_depth_attachment(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VkResult<DepthAttachment>;
    fn destroy_depth_attachment(&self, depth: &DepthAttachment);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // --- command buffers ---
    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: ClearColor,
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_geometry(&self, cmd: vk::CommandBuffer, geometry: &RenderInfo);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32);

    // --- per frame ---
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn queue_submit(&self, submission: &Submission) -> VkResult<()>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    // --- deferred destruction ---
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn destroy_image(&self, image: vk::Image);
    fn free_memory(&self, memory: vk::DeviceMemory);
}
