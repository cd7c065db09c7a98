// SPDX-License-Identifier: CEPL-1.0
//! Contracts for the collaborators that own pipelines and per-image uniforms.
//! Their objects depend on the swapchain, so the frame loop drives their
//! lifetime through these hooks.

use anyhow::Result;
use ash::vk;

use crate::gpu::Gpu;
use crate::scene::MaterialId;
use crate::swapchain::Epoch;

/// What a pipeline is compiled against.
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub render_pass: vk::RenderPass,
    pub extent: vk::Extent2D,
    pub color_format: vk::Format,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaterialPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub epoch: Epoch,
}

pub trait PipelineProvider<G: Gpu> {
    /// Replaces every material pipeline with one valid for `target`.
    /// Called after each swapchain build, with the device idle.
    fn rebuild(&mut self, gpu: &G, target: &RenderTarget) -> Result<()>;
    fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline>;
    /// Destroys everything. Called once at shutdown.
    fn release(&mut self, gpu: &G);
}

pub trait UniformProvider<G: Gpu> {
    /// Allocates per-image uniform storage and descriptor sets.
    fn create(&mut self, gpu: &G, image_count: usize) -> Result<()>;
    /// Updates the uniform contents read by the frame targeting `image_index`.
    fn refresh(&mut self, gpu: &G, image_index: usize) -> Result<()>;
    fn descriptor_set(&self, image_index: usize) -> Option<vk::DescriptorSet>;
    /// Destroys the descriptor pool and per-image storage. Runs first when
    /// the swapchain is torn down.
    fn free(&mut self, gpu: &G);
    /// Destroys objects that outlive swapchain rebuilds. Called once at shutdown.
    fn release(&mut self, _gpu: &G) {}
}
