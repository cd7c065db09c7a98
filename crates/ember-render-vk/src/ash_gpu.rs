// SPDX-License-Identifier: CEPL-1.0
//! [`Gpu`] on a real device through `ash`.

use std::ffi::{c_char, CStr};

use anyhow::{anyhow, bail, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use ember_render::{ClearColor, PresentTarget};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, info};

use crate::gpu::{CreatedSwapchain, DepthAttachment, Gpu, Submission, SwapchainRequest, VsyncMode};
use crate::scene::RenderInfo;

#[derive(Clone, Copy, Debug)]
struct QueueFamilies {
    graphics: u32,
    present: u32,
}

pub struct AshGpu {
    _entry: Entry,
    instance: Instance,
    #[cfg(debug_assertions)]
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    phys: vk::PhysicalDevice,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,

    swapchain_loader: swapchain::Device,
    cmd_pool: vk::CommandPool,
    depth_format: vk::Format,
}

impl AshGpu {
    pub fn new<T: PresentTarget + ?Sized>(target: &T) -> Result<Self> {
        // STRICT ORDER:
        // 1) instance (WSI extensions, validation in debug builds)
        // 2) surface FROM THIS INSTANCE
        // 3) physical device + queue families checked against the surface
        // 4) device, queues, swapchain loader, command pool
        let display = target
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let window = target
            .window_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();

        let entry = Entry::linked();
        unsafe {
            let instance = create_instance(&entry, display).context("create_instance")?;
            #[cfg(debug_assertions)]
            let debug = create_debug_messenger(&entry, &instance);

            let surface_loader = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(&entry, &instance, display, window, None)
                .context("ash_window::create_surface")?;

            let (phys, families) = pick_device(&instance, &surface_loader, surface)?;
            let device = create_device(&instance, phys, families)?;
            let graphics_queue = device.get_device_queue(families.graphics, 0);
            let present_queue = device.get_device_queue(families.present, 0);

            let swapchain_loader = swapchain::Device::new(&instance, &device);
            let pool_info = vk::CommandPoolCreateInfo {
                s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
                queue_family_index: families.graphics,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let cmd_pool = device
                .create_command_pool(&pool_info, None)
                .context("create_command_pool")?;

            Ok(Self {
                _entry: entry,
                mem_props: instance.get_physical_device_memory_properties(phys),
                depth_format: pick_depth_format(&instance, phys),
                instance,
                #[cfg(debug_assertions)]
                debug,
                surface_loader,
                surface,
                phys,
                device,
                families,
                graphics_queue,
                present_queue,
                swapchain_loader,
                cmd_pool,
            })
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn find_memory_type(&self, type_bits: u32, req: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.mem_props.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(req)
        })
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let buffer = self.device.create_buffer(&bci, None)?;
            let req = self.device.get_buffer_memory_requirements(buffer);
            let Some(memory_type_index) = self.find_memory_type(req.memory_type_bits, props) else {
                self.device.destroy_buffer(buffer, None);
                bail!("no memory type with {props:?} for buffer usage {usage:?}");
            };
            let mai = vk::MemoryAllocateInfo {
                s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                allocation_size: req.size,
                memory_type_index,
                ..Default::default()
            };
            let memory = match self.device.allocate_memory(&mai, None) {
                Ok(m) => m,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e.into());
                }
            };
            self.device.bind_buffer_memory(buffer, memory, 0)?;
            Ok((buffer, memory))
        }
    }

    /// Copies `bytes` into host-visible, host-coherent `memory`.
    pub fn write_memory(&self, memory: vk::DeviceMemory, bytes: &[u8]) -> Result<()> {
        unsafe {
            let ptr = self.device.map_memory(
                memory,
                0,
                bytes.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    /// Device-local buffer filled through a staging copy. Blocks until the
    /// copy has finished.
    pub fn upload_buffer(
        &self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let size = bytes.len() as vk::DeviceSize;
        let (staging, staging_mem) = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let result = self
            .write_memory(staging_mem, bytes)
            .and_then(|()| {
                self.create_buffer(
                    size,
                    usage | vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )
            })
            .and_then(|(dst, dst_mem)| match self.copy_buffer(staging, dst, size) {
                Ok(()) => Ok((dst, dst_mem)),
                Err(e) => {
                    self.destroy_buffer(dst);
                    self.free_memory(dst_mem);
                    Err(e)
                }
            });
        self.destroy_buffer(staging);
        self.free_memory(staging_mem);
        result
    }

    fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> Result<()> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe {
            let cmd = *self
                .device
                .allocate_command_buffers(&ai)?
                .first()
                .context("no command buffer allocated")?;
            let bi = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            let result = self
                .device
                .begin_command_buffer(cmd, &bi)
                .and_then(|()| {
                    self.device
                        .cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region));
                    self.device.end_command_buffer(cmd)
                })
                .and_then(|()| {
                    self.device.queue_submit(
                        self.graphics_queue,
                        std::slice::from_ref(&si),
                        vk::Fence::null(),
                    )
                })
                .and_then(|()| self.device.queue_wait_idle(self.graphics_queue));
            self.device
                .free_command_buffers(self.cmd_pool, std::slice::from_ref(&cmd));
            result.context("staging copy")
        }
    }
}

// STRICT TEARDOWN ORDER:
// - device idle
// - command pool BEFORE device
// - device BEFORE surface
// - surface and debug messenger BEFORE instance; instance last
// Swapchain-scoped objects are gone by now (the frame loop frees them on shutdown).
impl Drop for AshGpu {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.cmd_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            #[cfg(debug_assertions)]
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl Gpu for AshGpu {
    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let ci = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&ci, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&ci, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
        }
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VkResult<CreatedSwapchain> {
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.phys, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.phys, self.surface)?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.phys, self.surface)?,
            )
        };
        let (surf_format, pick_reason) =
            pick_surface_format(&formats).ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        let present_mode = choose_present_mode(&modes, request.vsync, request.vsync_mode);
        debug!(
            "surface format {:?}/{:?} ({pick_reason}), present mode {:?}",
            surf_format.format, surf_format.color_space, present_mode
        );

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        // Images are shared when graphics and present live in different families.
        let family_indices = [self.families.graphics, self.families.present];
        let (sharing_mode, family_count) = if self.families.graphics != self.families.present {
            (vk::SharingMode::CONCURRENT, 2)
        } else {
            (vk::SharingMode::EXCLUSIVE, 0)
        };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count: request.image_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: request.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: family_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };
        let handle = unsafe { self.swapchain_loader.create_swapchain(&swap_info, None)? };
        Ok(CreatedSwapchain {
            handle,
            format: surf_format.format,
            present_mode,
        })
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn create_color_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let iv_info = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: subresource(vk::ImageAspectFlags::COLOR),
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&iv_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        let attachments = [
            vk::AttachmentDescription {
                format: color_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                ..Default::default()
            },
            vk::AttachmentDescription {
                format: depth_format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ..Default::default()
            },
        ];
        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: 1,
            p_color_attachments: &color_ref,
            p_depth_stencil_attachment: &depth_ref,
            ..Default::default()
        };
        // Attachment writes wait for the acquire semaphore's stage.
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_stage_mask: stages,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ..Default::default()
        };
        let ci = vk::RenderPassCreateInfo {
            s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: 1,
            p_dependencies: &dependency,
            ..Default::default()
        };
        unsafe { self.device.create_render_pass(&ci, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    fn create_depth_attachment(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> VkResult<DepthAttachment> {
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let image = self.device.create_image(&img_ci, None)?;
            let mut depth = DepthAttachment {
                image,
                format,
                ..Default::default()
            };
            let req = self.device.get_image_memory_requirements(image);
            let allocated = self
                .find_memory_type(req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                .and_then(|memory_type_index| {
                    let alloc = vk::MemoryAllocateInfo {
                        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                        allocation_size: req.size,
                        memory_type_index,
                        ..Default::default()
                    };
                    depth.memory = self.device.allocate_memory(&alloc, None)?;
                    self.device.bind_image_memory(image, depth.memory, 0)?;
                    let view_ci = vk::ImageViewCreateInfo {
                        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                        image,
                        view_type: vk::ImageViewType::TYPE_2D,
                        format,
                        subresource_range: subresource(vk::ImageAspectFlags::DEPTH),
                        ..Default::default()
                    };
                    depth.view = self.device.create_image_view(&view_ci, None)?;
                    Ok(())
                });
            match allocated {
                Ok(()) => Ok(depth),
                Err(e) => {
                    self.destroy_depth_attachment(&depth);
                    Err(e)
                }
            }
        }
    }

    fn destroy_depth_attachment(&self, depth: &DepthAttachment) {
        unsafe {
            if depth.view != vk::ImageView::null() {
                self.device.destroy_image_view(depth.view, None);
            }
            self.device.destroy_image(depth.image, None);
            if depth.memory != vk::DeviceMemory::null() {
                self.device.free_memory(depth.memory, None);
            }
        }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let ci = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        unsafe { self.device.create_framebuffer(&ci, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.cmd_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count,
            ..Default::default()
        };
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(self.cmd_pool, buffers) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(cmd, &bi) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: ClearColor,
    ) {
        let clears = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear.0 },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_bind_geometry(&self, cmd: vk::CommandBuffer, geometry: &RenderInfo) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[geometry.vertex_buffer], &[0]);
            self.device.cmd_bind_index_buffer(
                cmd,
                geometry.index_buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            )
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        unsafe { self.device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        }
    }

    fn queue_submit(&self, submission: &Submission) -> VkResult<()> {
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &submission.wait,
            p_wait_dst_stage_mask: &submission.wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &submission.command_buffer,
            signal_semaphore_count: 1,
            p_signal_semaphores: &submission.signal,
            ..Default::default()
        };
        unsafe {
            self.device.queue_submit(
                self.graphics_queue,
                std::slice::from_ref(&si),
                submission.fence,
            )
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present)
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }
}

fn subresource(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

unsafe fn create_instance(entry: &Entry, display: RawDisplayHandle) -> Result<Instance> {
    let app = c"ember";
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    #[allow(unused_mut)]
    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .context("enumerate_required_extensions")?
        .to_vec();
    #[allow(unused_mut)]
    let mut layers: Vec<*const c_char> = Vec::new();

    #[cfg(debug_assertions)]
    {
        extensions.push(debug_utils::NAME.as_ptr());
        let available = entry
            .enumerate_instance_layer_properties()
            .unwrap_or_default();
        if available
            .iter()
            .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
        {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("validation layer not installed; running without it");
        }
    }

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };
    Ok(entry.create_instance(&create_info, None)?)
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

/// Validation output is nice to have; a missing messenger is not an error.
#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            tracing::warn!("debug messenger unavailable: {e}");
            None
        }
    }
}

/// Prefers a discrete GPU with one family doing both graphics and present.
unsafe fn pick_device(
    instance: &Instance,
    surf_i: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;

    for phys in instance.enumerate_physical_devices()? {
        let has_swapchain = instance
            .enumerate_device_extension_properties(phys)
            .unwrap_or_default()
            .iter()
            .any(|e| e.extension_name_as_c_str() == Ok(swapchain::NAME));
        if !has_swapchain {
            continue;
        }

        let qprops = instance.get_physical_device_queue_family_properties(phys);
        let presents = |i: u32| {
            surf_i
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        };
        let graphics: Vec<u32> = (0..qprops.len() as u32)
            .filter(|&i| {
                qprops[i as usize]
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS)
            })
            .collect();
        let families = match graphics.iter().copied().find(|&i| presents(i)) {
            Some(i) => QueueFamilies {
                graphics: i,
                present: i,
            },
            None => match (
                graphics.first().copied(),
                (0..qprops.len() as u32).find(|&i| presents(i)),
            ) {
                (Some(g), Some(p)) => QueueFamilies {
                    graphics: g,
                    present: p,
                },
                _ => continue,
            },
        };

        let props = instance.get_physical_device_properties(phys);
        let mut score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 4,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 1,
        } * 2;
        if families.graphics == families.present {
            score += 1;
        }
        if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
            best = Some((score, phys, families));
        }
    }

    let (_, phys, families) = best.ok_or_else(|| anyhow!("no suitable physical device/queue family"))?;
    let props = instance.get_physical_device_properties(phys);
    info!(
        "device: {} ({:?}), graphics family {}, present family {}",
        props
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy(),
        props.device_type,
        families.graphics,
        families.present
    );
    Ok((phys, families))
}

unsafe fn create_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let mut unique = vec![families.graphics];
    if families.present != families.graphics {
        unique.push(families.present);
    }
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique
        .iter()
        .map(|&queue_family_index| vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        })
        .collect();
    let device_exts = [swapchain::NAME.as_ptr()];

    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: queue_infos.len() as u32,
        p_queue_create_infos: queue_infos.as_ptr(),
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        ..Default::default()
    };
    instance
        .create_device(phys, &dinfo, None)
        .context("create_device")
}

unsafe fn pick_depth_format(instance: &Instance, phys: vk::PhysicalDevice) -> vk::Format {
    // Prefer 32f → 24+S8 → 16
    let candidates = [
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    candidates
        .into_iter()
        .find(|&fmt| {
            instance
                .get_physical_device_format_properties(phys, fmt)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .unwrap_or(vk::Format::D32_SFLOAT)
}

fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<(vk::SurfaceFormatKHR, &'static str)> {
    let find = |format: vk::Format| formats.iter().copied().find(|f| f.format == format);
    find(vk::Format::B8G8R8A8_SRGB)
        .map(|f| (f, "sdr_bgra8_srgb"))
        .or_else(|| find(vk::Format::R8G8B8A8_SRGB).map(|f| (f, "sdr_rgba8_srgb")))
        .or_else(|| {
            formats
                .iter()
                .copied()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_UNORM
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .map(|f| (f, "sdr_bgra8_unorm_srgbcs"))
        })
        .or_else(|| formats.first().map(|f| (*f, "driver_default")))
}

fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VsyncMode,
) -> vk::PresentModeKHR {
    let preference: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ],
        (true, VsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
        (true, VsyncMode::Fifo) => &[vk::PresentModeKHR::FIFO],
    };
    // FIFO is the one mode every surface supports.
    preference
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn srgb_surface_formats_win() {
        let formats = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let (picked, reason) = pick_surface_format(&formats).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(reason, "sdr_rgba8_srgb");

        let odd = [format(
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        )];
        assert_eq!(pick_surface_format(&odd).unwrap().1, "driver_default");
        assert!(pick_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_follows_vsync_policy() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        let fifo_only = [vk::PresentModeKHR::FIFO];

        assert_eq!(
            choose_present_mode(&all, false, VsyncMode::Mailbox),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&all, true, VsyncMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&all, true, VsyncMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&fifo_only, false, VsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }
}
