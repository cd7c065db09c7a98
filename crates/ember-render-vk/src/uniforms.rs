// SPDX-License-Identifier: CEPL-1.0
//! Per-image camera uniform buffers for the built-in material.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use tracing::debug;

use crate::ash_gpu::AshGpu;
use crate::providers::UniformProvider;
use crate::scene::UniformId;

pub const CAMERA_UNIFORMS: UniformId = UniformId(0);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct CameraUbo {
    mvp: Mat4,
}

/// Shared view-projection matrix. Writes land in the uniform buffer of the
/// next image rendered.
#[derive(Clone, Debug, Default)]
pub struct CameraHandle(Arc<Mutex<Mat4>>);

impl CameraHandle {
    pub fn new(mvp: Mat4) -> Self {
        Self(Arc::new(Mutex::new(mvp)))
    }

    pub fn set(&self, mvp: Mat4) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = mvp;
    }

    pub fn get(&self) -> Mat4 {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct CameraUniforms {
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    buffers: Vec<(vk::Buffer, vk::DeviceMemory)>,
    sets: Vec<vk::DescriptorSet>,
    camera: CameraHandle,
}

impl CameraUniforms {
    pub fn new(gpu: &AshGpu, camera: CameraHandle) -> Result<Self> {
        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        };
        let ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        let set_layout = unsafe { gpu.device().create_descriptor_set_layout(&ci, None) }
            .context("create_descriptor_set_layout")?;
        Ok(Self {
            set_layout,
            pool: vk::DescriptorPool::null(),
            buffers: Vec::new(),
            sets: Vec::new(),
            camera,
        })
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    fn allocate(&mut self, gpu: &AshGpu, image_count: usize) -> Result<()> {
        let ubo_size = std::mem::size_of::<CameraUbo>() as vk::DeviceSize;
        for _ in 0..image_count {
            self.buffers.push(gpu.create_buffer(
                ubo_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?);
        }

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: image_count as u32,
        };
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: image_count as u32,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        let device = gpu.device();
        self.pool = unsafe { device.create_descriptor_pool(&pool_ci, None) }?;

        let layouts = vec![self.set_layout; image_count];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.pool,
            descriptor_set_count: image_count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        self.sets = unsafe { device.allocate_descriptor_sets(&alloc) }?;

        let infos: Vec<vk::DescriptorBufferInfo> = self
            .buffers
            .iter()
            .map(|&(buffer, _)| vk::DescriptorBufferInfo {
                buffer,
                offset: 0,
                range: ubo_size,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = self
            .sets
            .iter()
            .zip(&infos)
            .map(|(&dst_set, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set,
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }
}

impl UniformProvider<AshGpu> for CameraUniforms {
    fn create(&mut self, gpu: &AshGpu, image_count: usize) -> Result<()> {
        if let Err(e) = self.allocate(gpu, image_count) {
            self.free(gpu);
            return Err(e.context("camera uniforms"));
        }
        debug!(image_count, "camera uniforms allocated");
        Ok(())
    }

    fn refresh(&mut self, gpu: &AshGpu, image_index: usize) -> Result<()> {
        let &(_, memory) = self
            .buffers
            .get(image_index)
            .with_context(|| format!("no camera uniforms for image {image_index}"))?;
        let ubo = CameraUbo {
            mvp: self.camera.get(),
        };
        gpu.write_memory(memory, bytemuck::bytes_of(&ubo))
    }

    fn descriptor_set(&self, image_index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(image_index).copied()
    }

    fn free(&mut self, gpu: &AshGpu) {
        let device = gpu.device();
        // Destroying the pool frees its sets.
        if self.pool != vk::DescriptorPool::null() {
            unsafe { device.destroy_descriptor_pool(self.pool, None) };
            self.pool = vk::DescriptorPool::null();
        }
        self.sets.clear();
        for (buffer, memory) in self.buffers.drain(..) {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
        }
    }

    fn release(&mut self, gpu: &AshGpu) {
        if self.set_layout != vk::DescriptorSetLayout::null() {
            unsafe {
                gpu.device()
                    .destroy_descriptor_set_layout(self.set_layout, None)
            };
            self.set_layout = vk::DescriptorSetLayout::null();
        }
    }
}
