// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use ember_render::ClearColor;
use tracing::debug;

use crate::error::{DeviceContext, FrameError, FrameResult};
use crate::gpu::Gpu;
use crate::providers::MaterialPipeline;
use crate::scene::{MaterialId, Scene, UniformId};
use crate::swapchain::{Epoch, SwapchainResources};

/// Where recording looks up per-instance bindings.
pub trait BindingSource {
    fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline>;
    fn descriptor_set(&self, uniforms: UniformId, image_index: usize) -> Option<vk::DescriptorSet>;
}

/// One pre-recorded command buffer per framebuffer, all from the same
/// swapchain epoch.
#[derive(Debug, Default)]
pub struct CommandBufferRecorder {
    buffers: Vec<vk::CommandBuffer>,
    epoch: Option<Epoch>,
}

impl CommandBufferRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frees the current set and records a fresh one.
    ///
    /// None of the current buffers may be referenced by a pending submission;
    /// callers wait for the device to go idle first.
    pub fn record<G: Gpu, B: BindingSource + ?Sized>(
        &mut self,
        gpu: &G,
        swapchain: &SwapchainResources,
        scene: &Scene,
        bindings: &B,
        clear: ClearColor,
    ) -> FrameResult<()> {
        self.free(gpu);

        let framebuffers = swapchain.framebuffers();
        if framebuffers.is_empty() {
            return Err(FrameError::invariant("recording with no framebuffers"));
        }
        self.buffers = gpu
            .allocate_command_buffers(framebuffers.len() as u32)
            .device("vkAllocateCommandBuffers")?;

        for (image_index, (&cmd, &framebuffer)) in
            self.buffers.iter().zip(framebuffers).enumerate()
        {
            record_one(
                gpu,
                cmd,
                framebuffer,
                image_index,
                swapchain,
                scene,
                bindings,
                clear,
            )?;
        }
        self.epoch = Some(swapchain.epoch());

        debug!(
            buffers = self.buffers.len(),
            instances = scene.instance_count(),
            epoch = swapchain.epoch().0,
            "command buffers recorded"
        );
        Ok(())
    }

    pub fn free<G: Gpu>(&mut self, gpu: &G) {
        if !self.buffers.is_empty() {
            gpu.free_command_buffers(&self.buffers);
            self.buffers.clear();
        }
        self.epoch = None;
    }

    /// The buffer for `image_index`, provided the set was recorded against
    /// `epoch`.
    pub fn buffer_for(&self, image_index: usize, epoch: Epoch) -> FrameResult<vk::CommandBuffer> {
        match self.epoch {
            Some(recorded) if recorded == epoch => {}
            Some(recorded) => {
                return Err(FrameError::invariant(format!(
                    "command buffers from epoch {} submitted against epoch {}",
                    recorded.0, epoch.0
                )))
            }
            None => return Err(FrameError::invariant("no command buffers recorded")),
        }
        self.buffers.get(image_index).copied().ok_or_else(|| {
            FrameError::invariant(format!(
                "no command buffer for image {image_index} ({} recorded)",
                self.buffers.len()
            ))
        })
    }

    pub fn epoch(&self) -> Option<Epoch> {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[allow(clippy::too_many_arguments)]
fn record_one<G: Gpu, B: BindingSource + ?Sized>(
    gpu: &G,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    image_index: usize,
    swapchain: &SwapchainResources,
    scene: &Scene,
    bindings: &B,
    clear: ClearColor,
) -> FrameResult<()> {
    let epoch = swapchain.epoch();

    gpu.begin_command_buffer(cmd)
        .device("vkBeginCommandBuffer")?;
    gpu.cmd_begin_render_pass(
        cmd,
        swapchain.render_pass(),
        framebuffer,
        swapchain.extent(),
        clear,
    );

    for (geometry, instances) in scene.groups() {
        // Geometry is bound once for all of its instances.
        gpu.cmd_bind_geometry(cmd, geometry);
        for instance in instances {
            let pipeline = bindings.pipeline(instance.material).ok_or_else(|| {
                FrameError::invariant(format!("no pipeline for {:?}", instance.material))
            })?;
            if pipeline.epoch != epoch {
                return Err(FrameError::invariant(format!(
                    "pipeline for {:?} built for epoch {}, swapchain is at {}",
                    instance.material, pipeline.epoch.0, epoch.0
                )));
            }
            let set = bindings
                .descriptor_set(instance.uniforms, image_index)
                .ok_or_else(|| {
                    FrameError::invariant(format!(
                        "no descriptor set for {:?} image {image_index}",
                        instance.uniforms
                    ))
                })?;

            gpu.cmd_bind_pipeline(cmd, pipeline.pipeline);
            gpu.cmd_bind_descriptor_set(cmd, pipeline.layout, set);
            gpu.cmd_draw_indexed(cmd, geometry.index_count);
        }
    }

    gpu.cmd_end_render_pass(cmd);
    gpu.end_command_buffer(cmd).device("vkEndCommandBuffer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Cmd, MockGpu};
    use crate::scene::InstanceInfo;
    use crate::swapchain::SwapchainConfig;
    use ember_render::RenderSize;
    use std::collections::HashMap;

    struct Bindings {
        pipelines: HashMap<MaterialId, MaterialPipeline>,
        sets: Vec<vk::DescriptorSet>,
    }

    impl BindingSource for Bindings {
        fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline> {
            self.pipelines.get(&material).copied()
        }

        fn descriptor_set(&self, uniforms: UniformId, image_index: usize) -> Option<vk::DescriptorSet> {
            (uniforms.0 == 0).then(|| self.sets.get(image_index).copied()).flatten()
        }
    }

    fn setup(gpu: &MockGpu) -> (SwapchainResources, Bindings) {
        let size = RenderSize {
            width: 640,
            height: 480,
        };
        let sc = SwapchainResources::build(gpu, size, SwapchainConfig::default(), Epoch::FIRST)
            .unwrap();
        let mut pipelines = HashMap::new();
        for m in [MaterialId(0), MaterialId(1)] {
            pipelines.insert(
                m,
                MaterialPipeline {
                    pipeline: gpu.mint(),
                    layout: gpu.mint(),
                    epoch: sc.epoch(),
                },
            );
        }
        let sets = (0..sc.image_count()).map(|_| gpu.mint()).collect();
        (sc, Bindings { pipelines, sets })
    }

    fn instance(material: u32) -> InstanceInfo {
        InstanceInfo {
            material: MaterialId(material),
            uniforms: UniformId(0),
        }
    }

    #[test]
    fn one_buffer_per_framebuffer_with_geometry_bound_once() {
        let gpu = MockGpu::new(2, 3);
        let (sc, bindings) = setup(&gpu);
        let mut scene = Scene::new();
        let quad = gpu.geometry(6);
        let tri = gpu.geometry(3);
        scene.add_instance(quad, instance(0));
        scene.add_instance(quad, instance(1));
        scene.add_instance(tri, instance(0));

        let mut recorder = CommandBufferRecorder::new();
        let clear = ClearColor::rgb(0.1, 0.2, 0.3);
        recorder
            .record(&gpu, &sc, &scene, &bindings, clear)
            .unwrap();
        assert_eq!(recorder.len(), sc.framebuffers().len());

        let p0 = bindings.pipelines[&MaterialId(0)].pipeline;
        let p1 = bindings.pipelines[&MaterialId(1)].pipeline;
        for image in 0..sc.image_count() {
            let set = bindings.sets[image];
            assert_eq!(
                gpu.commands_for_image(image),
                vec![
                    Cmd::BeginPass {
                        framebuffer: sc.framebuffers()[image],
                        clear
                    },
                    Cmd::BindGeometry(quad.vertex_buffer),
                    Cmd::BindPipeline(p0),
                    Cmd::BindSet(set),
                    Cmd::Draw(6),
                    Cmd::BindPipeline(p1),
                    Cmd::BindSet(set),
                    Cmd::Draw(6),
                    Cmd::BindGeometry(tri.vertex_buffer),
                    Cmd::BindPipeline(p0),
                    Cmd::BindSet(set),
                    Cmd::Draw(3),
                    Cmd::EndPass,
                ]
            );
        }
    }

    #[test]
    fn rerecord_frees_the_previous_set_first() {
        let gpu = MockGpu::new(2, 3);
        let (sc, bindings) = setup(&gpu);
        let scene = Scene::new();
        let mut recorder = CommandBufferRecorder::new();

        recorder
            .record(&gpu, &sc, &scene, &bindings, ClearColor::default())
            .unwrap();
        let first = recorder.buffer_for(0, sc.epoch()).unwrap();
        recorder
            .record(&gpu, &sc, &scene, &bindings, ClearColor::default())
            .unwrap();

        assert_ne!(recorder.buffer_for(0, sc.epoch()).unwrap(), first);
        assert_eq!(gpu.live("command buffer"), 3);
        assert_eq!(
            gpu.state()
                .log
                .iter()
                .filter(|l| *l == "free command buffers")
                .count(),
            1
        );
    }

    #[test]
    fn stale_pipeline_is_an_invariant_violation() {
        let gpu = MockGpu::new(2, 3);
        let (sc, mut bindings) = setup(&gpu);
        if let Some(p) = bindings.pipelines.get_mut(&MaterialId(0)) {
            p.epoch = Epoch(0);
        }
        let mut scene = Scene::new();
        scene.add_instance(gpu.geometry(3), instance(0));

        let err = CommandBufferRecorder::new()
            .record(&gpu, &sc, &scene, &bindings, ClearColor::default())
            .unwrap_err();
        assert!(matches!(err, FrameError::Invariant(_)));
    }

    #[test]
    fn missing_material_is_an_invariant_violation() {
        let gpu = MockGpu::new(2, 3);
        let (sc, bindings) = setup(&gpu);
        let mut scene = Scene::new();
        scene.add_instance(gpu.geometry(3), instance(7));

        let err = CommandBufferRecorder::new()
            .record(&gpu, &sc, &scene, &bindings, ClearColor::default())
            .unwrap_err();
        assert!(matches!(err, FrameError::Invariant(_)));
    }

    #[test]
    fn buffers_from_another_epoch_are_refused() {
        let gpu = MockGpu::new(2, 3);
        let (sc, bindings) = setup(&gpu);
        let mut recorder = CommandBufferRecorder::new();
        assert!(recorder.buffer_for(0, sc.epoch()).is_err());

        recorder
            .record(&gpu, &sc, &Scene::new(), &bindings, ClearColor::default())
            .unwrap();
        assert!(recorder.buffer_for(0, sc.epoch().next()).is_err());
        assert!(recorder.buffer_for(3, sc.epoch()).is_err());

        recorder.free(&gpu);
        assert!(recorder.is_empty());
        assert_eq!(gpu.live("command buffer"), 0);
    }
}
