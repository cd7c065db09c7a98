// SPDX-License-Identifier: CEPL-1.0
//! Recording device and window for driving the frame loop in tests.
//!
//! Submitted work stays in flight until someone waits on its fence (or the
//! device goes idle), which makes every missing wait observable as a
//! violation instead of a race.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::bail;
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use ember_render::{ClearColor, RenderSize, WindowSurface};

use crate::gpu::{CreatedSwapchain, DepthAttachment, Gpu, Submission, SwapchainRequest, VsyncMode};
use crate::providers::{MaterialPipeline, PipelineProvider, RenderTarget, UniformProvider};
use crate::scene::{MaterialId, RenderInfo};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Cmd {
    BeginPass {
        framebuffer: vk::Framebuffer,
        clear: ClearColor,
    },
    BindGeometry(vk::Buffer),
    BindPipeline(vk::Pipeline),
    BindSet(vk::DescriptorSet),
    Draw(u32),
    EndPass,
}

#[derive(Clone, Copy, Debug)]
struct FenceState {
    signaled: bool,
    pending: Option<(vk::CommandBuffer, u32)>,
}

#[derive(Default)]
pub(crate) struct MockState {
    next_handle: u64,
    pub caps: vk::SurfaceCapabilitiesKHR,
    fences: HashMap<vk::Fence, FenceState>,
    semaphores: HashSet<vk::Semaphore>,
    images: Vec<vk::Image>,
    next_image: u32,
    live_command_buffers: Vec<vk::CommandBuffer>,
    live: HashMap<&'static str, i64>,
    bound_buffers: HashMap<vk::CommandBuffer, HashSet<vk::Buffer>>,

    pub commands: HashMap<vk::CommandBuffer, Vec<Cmd>>,
    pub acquire_script: VecDeque<VkResult<(u32, bool)>>,
    pub present_script: VecDeque<VkResult<bool>>,
    pub submit_script: VecDeque<VkResult<()>>,

    pub log: Vec<String>,
    pub violations: Vec<String>,
    pub swapchains_created: usize,
    pub last_request: Option<SwapchainRequest>,
    pub submitted_images: Vec<u32>,
    pub presented_images: Vec<u32>,
    pub fence_waits: usize,
    pub idle_waits: usize,
}

impl MockState {
    fn mint<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn created(&mut self, kind: &'static str) {
        *self.live.entry(kind).or_default() += 1;
    }

    fn destroyed(&mut self, kind: &'static str) {
        *self.live.entry(kind).or_default() -= 1;
        self.log.push(format!("destroy {kind}"));
    }

    fn work_pending(&self) -> bool {
        self.fences.values().any(|f| f.pending.is_some())
    }

    fn destroy_scoped(&mut self, kind: &'static str) {
        if self.work_pending() {
            self.violations
                .push(format!("{kind} destroyed while work is in flight"));
        }
        self.destroyed(kind);
    }

    /// Whether a submission that has not been waited on reads `buffer`.
    fn buffer_in_flight(&self, buffer: vk::Buffer) -> bool {
        self.fences
            .values()
            .filter_map(|f| f.pending)
            .filter_map(|(cmd, _)| self.bound_buffers.get(&cmd))
            .any(|bound| bound.contains(&buffer))
    }

    fn complete(fence: &mut FenceState) {
        fence.signaled = true;
        fence.pending = None;
    }
}

pub(crate) struct MockGpu {
    state: RefCell<MockState>,
}

impl MockGpu {
    /// A device whose surface follows the window size and offers
    /// `min_images..=max_images` swapchain images.
    pub fn new(min_images: u32, max_images: u32) -> Self {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        Self {
            state: RefCell::new(MockState {
                caps,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> Ref<'_, MockState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }

    pub fn mint<H: Handle>(&self) -> H {
        self.state.borrow_mut().mint()
    }

    pub fn note(&self, entry: impl Into<String>) {
        self.state.borrow_mut().log.push(entry.into());
    }

    pub fn live(&self, kind: &str) -> i64 {
        self.state.borrow().live.get(kind).copied().unwrap_or(0)
    }

    pub fn live_total(&self) -> i64 {
        self.state.borrow().live.values().sum()
    }

    pub fn geometry(&self, index_count: u32) -> RenderInfo {
        RenderInfo {
            vertex_buffer: self.mint(),
            index_buffer: self.mint(),
            index_count,
        }
    }

    pub fn commands_for_image(&self, image: usize) -> Vec<Cmd> {
        let s = self.state.borrow();
        s.live_command_buffers
            .get(image)
            .and_then(|cmd| s.commands.get(cmd))
            .cloned()
            .unwrap_or_default()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state.borrow().fences.get(&fence).map(|f| f.signaled)
    }
}

impl Gpu for MockGpu {
    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let semaphore = s.mint();
        s.semaphores.insert(semaphore);
        s.created("semaphore");
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if !s.semaphores.remove(&semaphore) {
            s.violations.push("unknown semaphore destroyed".into());
        }
        s.destroyed("semaphore");
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let fence = s.mint();
        s.fences.insert(
            fence,
            FenceState {
                signaled,
                pending: None,
            },
        );
        s.created("fence");
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.fences.remove(&fence) {
            Some(FenceState {
                pending: Some(_), ..
            }) => s.violations.push("fence destroyed with work in flight".into()),
            Some(_) => {}
            None => s.violations.push("unknown fence destroyed".into()),
        }
        s.destroyed("fence");
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.fence_waits += 1;
        s.log.push("wait fence".into());
        match s.fences.get_mut(&fence) {
            Some(f) if f.signaled || f.pending.is_some() => {
                MockState::complete(f);
                Ok(())
            }
            Some(_) => {
                s.violations
                    .push("waited on a reset fence nothing will signal".into());
                Err(vk::Result::TIMEOUT)
            }
            None => {
                s.violations.push("waited on unknown fence".into());
                Err(vk::Result::ERROR_UNKNOWN)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.fences.get_mut(&fence) {
            Some(f) if f.pending.is_some() => {
                s.violations.push("fence reset while work in flight".into());
            }
            Some(f) => f.signaled = false,
            None => s.violations.push("reset unknown fence".into()),
        }
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.idle_waits += 1;
        s.fences.values_mut().for_each(MockState::complete);
        Ok(())
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.borrow().caps)
    }

    fn create_swapchain(&self, request: &SwapchainRequest) -> VkResult<CreatedSwapchain> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let handle = s.mint();
        let images = (0..request.image_count).map(|_| s.mint()).collect();
        s.images = images;
        s.next_image = 0;
        s.swapchains_created += 1;
        s.last_request = Some(*request);
        s.created("swapchain");
        let present_mode = match (request.vsync, request.vsync_mode) {
            (false, _) => vk::PresentModeKHR::IMMEDIATE,
            (true, VsyncMode::Mailbox) => vk::PresentModeKHR::MAILBOX,
            (true, VsyncMode::Fifo) => vk::PresentModeKHR::FIFO,
        };
        Ok(CreatedSwapchain {
            handle,
            format: vk::Format::B8G8R8A8_SRGB,
            present_mode,
        })
    }

    fn swapchain_images(&self, _swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        Ok(self.state.borrow().images.clone())
    }

    fn destroy_swapchain(&self, _swapchain: vk::SwapchainKHR) {
        self.state.borrow_mut().destroy_scoped("swapchain");
    }

    fn create_color_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.created("image view");
        Ok(s.mint())
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {
        self.state.borrow_mut().destroy_scoped("image view");
    }

    fn create_render_pass(
        &self,
        _color_format: vk::Format,
        _depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.created("render pass");
        Ok(s.mint())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.state.borrow_mut().destroy_scoped("render pass");
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }

    fn create_depth_attachment(
        &self,
        _extent: vk::Extent2D,
        format: vk::Format,
    ) -> VkResult<DepthAttachment> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.created("depth");
        Ok(DepthAttachment {
            image: s.mint(),
            memory: s.mint(),
            view: s.mint(),
            format,
        })
    }

    fn destroy_depth_attachment(&self, _depth: &DepthAttachment) {
        self.state.borrow_mut().destroy_scoped("depth");
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if attachments.len() != 2 {
            s.violations
                .push(format!("framebuffer with {} attachments", attachments.len()));
        }
        s.created("framebuffer");
        Ok(s.mint())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.state.borrow_mut().destroy_scoped("framebuffer");
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| s.mint()).collect();
        s.live_command_buffers.extend_from_slice(&buffers);
        *s.live.entry("command buffer").or_default() += i64::from(count);
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let in_flight = s
            .fences
            .values()
            .filter_map(|f| f.pending)
            .any(|(cmd, _)| buffers.contains(&cmd));
        if in_flight {
            s.violations
                .push("command buffer freed while in flight".into());
        }
        s.live_command_buffers.retain(|c| !buffers.contains(c));
        for cmd in buffers {
            s.commands.remove(cmd);
            s.bound_buffers.remove(cmd);
        }
        *s.live.entry("command buffer").or_default() -= buffers.len() as i64;
        s.log.push("free command buffers".into());
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if !s.live_command_buffers.contains(&cmd) {
            s.violations.push("recording into a freed command buffer".into());
        }
        s.commands.insert(cmd, Vec::new());
        s.bound_buffers.remove(&cmd);
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        _render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _extent: vk::Extent2D,
        clear: ClearColor,
    ) {
        self.push(cmd, Cmd::BeginPass { framebuffer, clear });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.push(cmd, Cmd::EndPass);
    }

    fn cmd_bind_geometry(&self, cmd: vk::CommandBuffer, geometry: &RenderInfo) {
        self.push(cmd, Cmd::BindGeometry(geometry.vertex_buffer));
        self.state
            .borrow_mut()
            .bound_buffers
            .entry(cmd)
            .or_default()
            .extend([geometry.vertex_buffer, geometry.index_buffer]);
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.push(cmd, Cmd::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.push(cmd, Cmd::BindSet(set));
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        self.push(cmd, Cmd::Draw(index_count));
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if !s.semaphores.contains(&signal) {
            s.violations.push("acquire signals unknown semaphore".into());
        }
        s.log.push("acquire".into());
        if let Some(scripted) = s.acquire_script.pop_front() {
            return scripted;
        }
        let count = s.images.len() as u32;
        let index = s.next_image;
        s.next_image = (index + 1) % count.max(1);
        Ok((index, false))
    }

    fn queue_submit(&self, submission: &Submission) -> VkResult<()> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if let Some(Err(result)) = s.submit_script.pop_front() {
            return Err(result);
        }
        let Some(image) = s
            .live_command_buffers
            .iter()
            .position(|c| *c == submission.command_buffer)
        else {
            s.violations.push("submitted a freed command buffer".into());
            return Ok(());
        };
        let image = image as u32;
        let busy = s
            .fences
            .values()
            .filter_map(|f| f.pending)
            .any(|(_, i)| i == image);
        if busy {
            s.violations
                .push(format!("image {image} submitted while still in flight"));
        }
        match s.fences.get_mut(&submission.fence) {
            Some(f) if !f.signaled && f.pending.is_none() => {
                f.pending = Some((submission.command_buffer, image));
            }
            Some(_) => s.violations.push("submitted with an unreset fence".into()),
            None => s.violations.push("submitted with unknown fence".into()),
        }
        s.submitted_images.push(image);
        s.log.push("submit".into());
        Ok(())
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.presented_images.push(image_index);
        s.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.buffer_in_flight(buffer) {
            s.violations.push(format!(
                "buffer {} destroyed while a submission still draws it",
                buffer.as_raw()
            ));
        }
        s.log.push(format!("destroy buffer {}", buffer.as_raw()));
    }

    fn destroy_image(&self, image: vk::Image) {
        self.note(format!("destroy image {}", image.as_raw()));
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.note(format!("free memory {}", memory.as_raw()));
    }
}

impl MockGpu {
    fn push(&self, cmd: vk::CommandBuffer, recorded: Cmd) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.commands.get_mut(&cmd) {
            Some(list) => list.push(recorded),
            None => s.violations.push("command recorded outside begin/end".into()),
        }
    }
}

/// Window whose framebuffer size is scripted. The last size sticks.
pub(crate) struct MockWindow {
    sizes: RefCell<VecDeque<RenderSize>>,
    current: Cell<RenderSize>,
    pub waits: Cell<usize>,
}

impl MockWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self::scripted(&[RenderSize { width, height }])
    }

    pub fn scripted(sizes: &[RenderSize]) -> Self {
        Self {
            sizes: RefCell::new(sizes.iter().copied().collect()),
            current: Cell::new(RenderSize {
                width: 0,
                height: 0,
            }),
            waits: Cell::new(0),
        }
    }

    pub fn set_size(&self, width: u32, height: u32) {
        self.sizes.borrow_mut().clear();
        self.current.set(RenderSize { width, height });
    }

    pub fn push_sizes(&self, sizes: &[RenderSize]) {
        self.sizes.borrow_mut().extend(sizes.iter().copied());
    }
}

impl WindowSurface for MockWindow {
    fn framebuffer_size(&self) -> RenderSize {
        if let Some(next) = self.sizes.borrow_mut().pop_front() {
            self.current.set(next);
        }
        self.current.get()
    }

    fn wait_events(&self) {
        self.waits.set(self.waits.get() + 1);
    }
}

/// One pipeline per listed material, rebuilt for every target.
#[derive(Default)]
pub(crate) struct StubPipelines {
    materials: Vec<MaterialId>,
    built: HashMap<MaterialId, MaterialPipeline>,
}

impl StubPipelines {
    pub fn new(materials: &[MaterialId]) -> Self {
        Self {
            materials: materials.to_vec(),
            built: HashMap::new(),
        }
    }
}

impl PipelineProvider<MockGpu> for StubPipelines {
    fn rebuild(&mut self, gpu: &MockGpu, target: &RenderTarget) -> anyhow::Result<()> {
        self.built.clear();
        gpu.note("rebuild pipelines");
        for material in &self.materials {
            self.built.insert(
                *material,
                MaterialPipeline {
                    pipeline: gpu.mint(),
                    layout: gpu.mint(),
                    epoch: target.epoch,
                },
            );
        }
        Ok(())
    }

    fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline> {
        self.built.get(&material).copied()
    }

    fn release(&mut self, gpu: &MockGpu) {
        self.built.clear();
        gpu.note("release pipelines");
    }
}

/// One descriptor set per swapchain image.
#[derive(Default)]
pub(crate) struct StubUniforms {
    sets: Vec<vk::DescriptorSet>,
}

impl UniformProvider<MockGpu> for StubUniforms {
    fn create(&mut self, gpu: &MockGpu, image_count: usize) -> anyhow::Result<()> {
        self.sets = (0..image_count).map(|_| gpu.mint()).collect();
        gpu.note("create uniforms");
        Ok(())
    }

    fn refresh(&mut self, gpu: &MockGpu, image_index: usize) -> anyhow::Result<()> {
        if image_index >= self.sets.len() {
            bail!("no uniforms for image {image_index}");
        }
        gpu.note(format!("refresh uniforms {image_index}"));
        Ok(())
    }

    fn descriptor_set(&self, image_index: usize) -> Option<vk::DescriptorSet> {
        self.sets.get(image_index).copied()
    }

    fn free(&mut self, gpu: &MockGpu) {
        if !self.sets.is_empty() {
            gpu.note("free uniforms");
        }
        self.sets.clear();
    }
}
