// SPDX-License-Identifier: CEPL-1.0
//! The built-in material: flat vertex colors through the camera transform.

use std::ffi::CStr;
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use ember_render::VertexFormat;
use tracing::debug;

use crate::ash_gpu::AshGpu;
use crate::providers::{MaterialPipeline, PipelineProvider, RenderTarget};
use crate::scene::MaterialId;

pub const BASIC_MATERIAL: MaterialId = MaterialId(0);

pub struct BasicPipelines {
    layout: vk::PipelineLayout,
    current: Option<MaterialPipeline>,
}

impl BasicPipelines {
    /// Geometry drawn with [`BASIC_MATERIAL`] must use this layout.
    pub const VERTEX_FORMAT: VertexFormat = VertexFormat::POSITION_COLOR;

    /// `set_layout` is the camera layout bound at set 0; it must outlive this provider.
    pub fn new(gpu: &AshGpu, set_layout: vk::DescriptorSetLayout) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        let layout = unsafe { gpu.device().create_pipeline_layout(&layout_info, None) }
            .context("create_pipeline_layout")?;
        Ok(Self {
            layout,
            current: None,
        })
    }

    fn destroy_pipeline(&mut self, gpu: &AshGpu) {
        if let Some(old) = self.current.take() {
            unsafe { gpu.device().destroy_pipeline(old.pipeline, None) };
        }
    }
}

impl PipelineProvider<AshGpu> for BasicPipelines {
    fn rebuild(&mut self, gpu: &AshGpu, target: &RenderTarget) -> Result<()> {
        self.destroy_pipeline(gpu);
        let pipeline = unsafe { create_pipeline(gpu.device(), target, self.layout) }?;
        debug!(
            epoch = target.epoch.0,
            "basic pipeline built for {}x{}", target.extent.width, target.extent.height
        );
        self.current = Some(MaterialPipeline {
            pipeline,
            layout: self.layout,
            epoch: target.epoch,
        });
        Ok(())
    }

    fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline> {
        self.current.filter(|_| material == BASIC_MATERIAL)
    }

    fn release(&mut self, gpu: &AshGpu) {
        self.destroy_pipeline(gpu);
        if self.layout != vk::PipelineLayout::null() {
            unsafe { gpu.device().destroy_pipeline_layout(self.layout, None) };
            self.layout = vk::PipelineLayout::null();
        }
    }
}

unsafe fn shader_module(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(bytes))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(unsafe { device.create_shader_module(&ci, None) }?)
}

fn vertex_offset(element: VertexFormat) -> u32 {
    BasicPipelines::VERTEX_FORMAT
        .offset_of(element)
        .unwrap_or_default() as u32
}

/// Viewport and scissor are baked from `target.extent`, so the pipeline is
/// only valid for the swapchain epoch it was built against.
unsafe fn create_pipeline(
    device: &ash::Device,
    target: &RenderTarget,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let vs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/basic.vert.spv"));
    let fs_bytes = include_bytes!(concat!(env!("OUT_DIR"), "/basic.frag.spv"));
    let vs = unsafe { shader_module(device, vs_bytes) }?;
    let fs = match unsafe { shader_module(device, fs_bytes) } {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };
    let entry: &CStr = c"main";

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: BasicPipelines::VERTEX_FORMAT.stride() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let va = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: vertex_offset(VertexFormat::POSITION),
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R8G8B8A8_UNORM,
            offset: vertex_offset(VertexFormat::COLOR),
        },
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: target.extent.width as f32,
        height: target.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target.extent,
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: &viewport,
        scissor_count: 1,
        p_scissors: &scissor,
        ..Default::default()
    };

    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: vk::TRUE,
        depth_write_enable: vk::TRUE,
        depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        layout,
        render_pass: target.render_pass,
        subpass: 0,
        ..Default::default()
    };

    let created = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    let pipelines =
        created.map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;
    pipelines
        .first()
        .copied()
        .context("create_graphics_pipelines returned nothing")
}
