// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: frame lifecycle and swapchain-scoped resources on `ash`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ash::vk;
use ember_render::{
    BufferVertexConsumer, ClearColor, PresentTarget, RenderSize, Renderer, VertexConsumer,
};
use tracing::{error, info};

mod ash_gpu;
mod deferred;
mod error;
mod frame;
mod gpu;
#[cfg(test)]
mod mock;
mod pipeline;
mod providers;
mod recorder;
mod scene;
mod swapchain;
mod sync;
mod uniforms;

pub use ash_gpu::AshGpu;
pub use deferred::{DeferredTask, DeferredTaskQueue};
pub use error::{FrameError, FrameResult};
pub use frame::{FrameLoopController, FrameState, FrameStats, Providers};
pub use gpu::{CreatedSwapchain, DepthAttachment, Gpu, Submission, SwapchainRequest, VsyncMode};
pub use pipeline::{BasicPipelines, BASIC_MATERIAL};
pub use providers::{MaterialPipeline, PipelineProvider, RenderTarget, UniformProvider};
pub use recorder::{BindingSource, CommandBufferRecorder};
pub use scene::{InstanceInfo, MaterialId, RenderInfo, Scene, UniformId};
pub use swapchain::{Epoch, SwapchainConfig, SwapchainResources};
pub use sync::{FrameSlot, ImageInUseTable, SyncObjectPool};
pub use uniforms::{CameraHandle, CameraUniforms, CAMERA_UNIFORMS};

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Device-local vertex and index buffers owned by the caller until released.
#[derive(Debug)]
pub struct UploadedGeometry {
    pub info: RenderInfo,
    vertex_memory: vk::DeviceMemory,
    index_memory: vk::DeviceMemory,
}

impl UploadedGeometry {
    pub fn into_release_tasks(self) -> [DeferredTask; 2] {
        [
            DeferredTask::DestroyBuffer {
                buffer: self.info.vertex_buffer,
                memory: self.vertex_memory,
            },
            DeferredTask::DestroyBuffer {
                buffer: self.info.index_buffer,
                memory: self.index_memory,
            },
        ]
    }
}

pub struct VkRenderer {
    frames: FrameLoopController<AshGpu>,
    camera: CameraHandle,
}

impl VkRenderer {
    pub fn set_vsync_mode(&mut self, mode: VsyncMode) -> Result<()> {
        Ok(self.frames.set_vsync_mode(mode)?)
    }

    pub fn camera(&self) -> &CameraHandle {
        &self.camera
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.frames.swapchain().map(SwapchainResources::extent)
    }

    /// Uploads indexed geometry in [`BasicPipelines::VERTEX_FORMAT`]. Blocks
    /// until the copies finish.
    pub fn upload_geometry(
        &self,
        vertices: &BufferVertexConsumer,
        indices: &[u32],
    ) -> Result<UploadedGeometry> {
        if vertices.format() != BasicPipelines::VERTEX_FORMAT {
            bail!(
                "geometry in {:?}, basic material needs {:?}",
                vertices.format(),
                BasicPipelines::VERTEX_FORMAT
            );
        }
        let vertex_count = vertices.vertex_count();
        if vertex_count == 0 || indices.is_empty() {
            bail!("empty geometry ({vertex_count} vertices, {} indices)", indices.len());
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
            bail!("index {bad} out of range for {vertex_count} vertices");
        }

        let gpu = self.frames.gpu();
        let (vertex_buffer, vertex_memory) = gpu
            .upload_buffer(vertices.bytes(), vk::BufferUsageFlags::VERTEX_BUFFER)
            .context("upload vertices")?;
        let (index_buffer, index_memory) = match gpu
            .upload_buffer(bytemuck::cast_slice(indices), vk::BufferUsageFlags::INDEX_BUFFER)
        {
            Ok(uploaded) => uploaded,
            Err(e) => {
                gpu.destroy_buffer(vertex_buffer);
                gpu.free_memory(vertex_memory);
                return Err(e.context("upload indices"));
            }
        };

        Ok(UploadedGeometry {
            info: RenderInfo {
                vertex_buffer,
                index_buffer,
                index_count: indices.len() as u32,
            },
            vertex_memory,
            index_memory,
        })
    }

    pub fn add_instance(&mut self, geometry: RenderInfo, instance: InstanceInfo) {
        self.frames.scene_mut().add_instance(geometry, instance);
    }

    /// Drops the geometry from the scene and destroys its buffers once no
    /// frame can still read them.
    pub fn release_geometry(&mut self, geometry: UploadedGeometry) {
        let info = geometry.info;
        self.frames
            .release_geometry(&info, geometry.into_release_tasks());
    }

    pub fn enqueue_deferred(&self, task: DeferredTask) {
        self.frames.enqueue_deferred(task);
    }

    pub fn deferred_queue(&self) -> DeferredTaskQueue {
        self.frames.deferred_queue()
    }
}

impl Renderer for VkRenderer {
    fn new<T: PresentTarget + 'static>(target: Arc<T>) -> Result<Self> {
        let gpu = AshGpu::new(&*target).context("vulkan device")?;

        let camera = CameraHandle::default();
        let mut uniforms = CameraUniforms::new(&gpu, camera.clone())?;
        let pipelines = match BasicPipelines::new(&gpu, uniforms.set_layout()) {
            Ok(p) => p,
            Err(e) => {
                uniforms.release(&gpu);
                return Err(e);
            }
        };
        let providers = Providers {
            pipelines: Box::new(pipelines),
            uniforms: vec![Box::new(uniforms)],
        };

        let frames = FrameLoopController::initialize(
            gpu,
            Box::new(target),
            providers,
            SwapchainConfig::default(),
            ClearColor::default(),
        )
        .context("frame loop init")?;
        if let Some(sc) = frames.swapchain() {
            info!(
                "vk ready: {}x{}, {} images",
                sc.extent().width,
                sc.extent().height,
                sc.image_count()
            );
        }
        Ok(Self { frames, camera })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.frames.notify_resize(size.width, size.height);
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        Ok(self.frames.render_frame()?)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        if let Err(e) = self.frames.set_clear_color(ClearColor(rgba)) {
            error!("set_clear_color failed: {e}");
        }
    }

    fn set_vsync(&mut self, on: bool) {
        if let Err(e) = self.frames.set_vsync(on) {
            error!("set_vsync failed: {e}");
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(self.frames.shutdown()?)
    }
}
