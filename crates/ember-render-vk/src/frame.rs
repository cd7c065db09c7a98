// SPDX-License-Identifier: CEPL-1.0
//! The per-frame driver: fence waits, acquisition, submission, presentation,
//! and rebuilding everything swapchain-scoped when the surface goes stale.

use ash::vk;
use ember_render::{ClearColor, RenderSize, WindowSurface};
use tracing::{debug, error, info, trace, warn};

use crate::deferred::{DeferredTask, DeferredTaskQueue};
use crate::error::{DeviceContext, FrameError, FrameResult};
use crate::gpu::{Gpu, Submission, VsyncMode};
use crate::providers::{MaterialPipeline, PipelineProvider, UniformProvider};
use crate::recorder::{BindingSource, CommandBufferRecorder};
use crate::scene::{MaterialId, RenderInfo, Scene, UniformId};
use crate::swapchain::{Epoch, SwapchainConfig, SwapchainResources};
use crate::sync::{ImageInUseTable, SyncObjectPool};
use crate::MAX_FRAMES_IN_FLIGHT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Waiting(usize),
    Acquiring,
    Recording,
    Submitting,
    Presenting,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames that reached the end of the loop (acquire aborts excluded).
    pub frames: u64,
    pub submissions: u64,
    pub presentations: u64,
    /// Rebuilds after the initial build.
    pub rebuilds: u64,
    /// Full re-records, the initial one included.
    pub records: u64,
}

/// The external owners of pipelines and per-image uniforms.
/// `UniformId(n)` names `uniforms[n]`.
pub struct Providers<G: Gpu> {
    pub pipelines: Box<dyn PipelineProvider<G>>,
    pub uniforms: Vec<Box<dyn UniformProvider<G>>>,
}

impl<G: Gpu> BindingSource for Providers<G> {
    fn pipeline(&self, material: MaterialId) -> Option<MaterialPipeline> {
        self.pipelines.pipeline(material)
    }

    fn descriptor_set(&self, uniforms: UniformId, image_index: usize) -> Option<vk::DescriptorSet> {
        self.uniforms
            .get(uniforms.0 as usize)?
            .descriptor_set(image_index)
    }
}

pub struct FrameLoopController<G: Gpu> {
    gpu: G,
    window: Box<dyn WindowSurface>,
    providers: Providers<G>,
    config: SwapchainConfig,

    swapchain: Option<SwapchainResources>,
    sync: SyncObjectPool,
    images_in_flight: ImageInUseTable,
    recorder: CommandBufferRecorder,
    deferred: DeferredTaskQueue,

    scene: Scene,
    recorded_revision: Option<u64>,
    clear: ClearColor,

    current_slot: usize,
    resize_pending: bool,
    state: FrameState,
    stats: FrameStats,
    poisoned: bool,
    shut_down: bool,
}

impl<G: Gpu> FrameLoopController<G> {
    /// Builds the first swapchain (waiting out a minimized window) and
    /// records the initial command buffers.
    pub fn initialize(
        gpu: G,
        window: Box<dyn WindowSurface>,
        providers: Providers<G>,
        config: SwapchainConfig,
        clear: ClearColor,
    ) -> FrameResult<Self> {
        let mut this = Self {
            gpu,
            window,
            providers,
            config,
            swapchain: None,
            sync: SyncObjectPool::default(),
            images_in_flight: ImageInUseTable::default(),
            recorder: CommandBufferRecorder::new(),
            deferred: DeferredTaskQueue::new(),
            scene: Scene::new(),
            recorded_revision: None,
            clear,
            current_slot: 0,
            resize_pending: false,
            state: FrameState::Idle,
            stats: FrameStats::default(),
            poisoned: false,
            shut_down: false,
        };

        let size = this.wait_for_nonzero_extent();
        let swapchain = SwapchainResources::build(&this.gpu, size, this.config, Epoch::FIRST)?;
        this.install_swapchain(swapchain)?;
        Ok(this)
    }

    /// Renders one frame. Surface invalidation is handled internally; any
    /// error returned is fatal and poisons the controller.
    pub fn render_frame(&mut self) -> FrameResult<()> {
        self.guarded(Self::frame)
    }

    fn frame(&mut self) -> FrameResult<()> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Err(FrameError::NoSwapchain);
        };
        let swapchain_handle = swapchain.handle();
        let epoch = swapchain.epoch();
        let slot_index = self.current_slot;
        let slot = *self.sync.slot(slot_index)?;

        // STRICT ORDER:
        // 1) wait for this slot's previous submission
        self.enter(FrameState::Waiting(slot_index));
        self.gpu
            .wait_for_fence(slot.in_flight)
            .device("vkWaitForFences")?;

        // 2) deferred cleanup, now that this slot's work has retired
        let drained = self.deferred.drain(&self.gpu);
        if drained > 0 {
            debug!(drained, "deferred tasks run");
        }

        // 3) acquire; out-of-date abandons the frame without submitting
        self.enter(FrameState::Acquiring);
        let image_index = match self
            .gpu
            .acquire_next_image(swapchain_handle, slot.image_available)
        {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("acquire: swapchain out of date");
                self.rebuild_swapchain()?;
                self.enter(FrameState::Idle);
                return Ok(());
            }
            Err(result) => {
                return Err(FrameError::Device {
                    op: "vkAcquireNextImageKHR",
                    result,
                })
            }
        };
        let image = image_index as usize;

        // Scene edits invalidate every recorded buffer, including ones the
        // other slot may still be executing.
        if self.recorded_revision != Some(self.scene.revision()) {
            self.enter(FrameState::Recording);
            self.gpu.wait_idle().device("vkDeviceWaitIdle")?;
            self.record()?;
        }

        // 4) per-image uniforms for the acquired image
        for uniforms in &mut self.providers.uniforms {
            uniforms.refresh(&self.gpu, image)?;
        }

        // 5) + 6) an earlier frame still targeting this image must finish first
        if let Some(owner) = self.images_in_flight.claim(image, slot_index)? {
            if owner != slot_index {
                let fence = self.sync.slot(owner)?.in_flight;
                self.gpu.wait_for_fence(fence).device("vkWaitForFences")?;
            }
        }

        // 7) submit
        self.enter(FrameState::Submitting);
        let command_buffer = self.recorder.buffer_for(image, epoch)?;
        self.gpu
            .reset_fence(slot.in_flight)
            .device("vkResetFences")?;
        self.gpu
            .queue_submit(&Submission {
                command_buffer,
                wait: slot.image_available,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal: slot.render_finished,
                fence: slot.in_flight,
            })
            .device("vkQueueSubmit")?;
        self.stats.submissions += 1;

        // 8) present
        self.enter(FrameState::Presenting);
        let present = self
            .gpu
            .queue_present(swapchain_handle, image_index, slot.render_finished);
        self.stats.presentations += 1;
        let stale = match present {
            // ash reports SUBOPTIMAL_KHR as Ok(true)
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(result) => {
                return Err(FrameError::Device {
                    op: "vkQueuePresentKHR",
                    result,
                })
            }
        };

        // 9) rebuild on a stale surface or a pending resize
        if stale || self.resize_pending {
            debug!(stale, resize = self.resize_pending, "present: rebuilding swapchain");
            self.rebuild_swapchain()?;
        }

        // 10) advance
        self.current_slot = (self.current_slot + 1) % self.sync.len().max(1);
        self.stats.frames += 1;
        self.enter(FrameState::Idle);
        Ok(())
    }

    /// Best-effort: the swapchain is rebuilt at the end of the next frame.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        debug!(width, height, "resize requested");
        self.resize_pending = true;
    }

    /// Returns whether the color changed. A change re-records every command
    /// buffer once the device is idle.
    pub fn set_clear_color(&mut self, clear: ClearColor) -> FrameResult<bool> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.clear == clear {
            return Ok(false);
        }
        self.guarded(|this| {
            this.clear = clear;
            if this.swapchain.is_some() {
                this.gpu.wait_idle().device("vkDeviceWaitIdle")?;
                this.record()?;
            }
            Ok(true)
        })
    }

    pub fn set_vsync(&mut self, vsync: bool) -> FrameResult<()> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.config.vsync == vsync {
            return Ok(());
        }
        self.config.vsync = vsync;
        self.guarded(Self::rebuild_if_built)
    }

    pub fn set_vsync_mode(&mut self, mode: VsyncMode) -> FrameResult<()> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.config.vsync_mode == mode {
            return Ok(());
        }
        self.config.vsync_mode = mode;
        self.guarded(Self::rebuild_if_built)
    }

    fn rebuild_if_built(&mut self) -> FrameResult<()> {
        if self.swapchain.is_some() {
            self.rebuild_swapchain()?;
        }
        Ok(())
    }

    pub fn enqueue_deferred(&self, task: DeferredTask) {
        self.deferred.push(task);
    }

    /// Drops `geometry` from the scene and runs `tasks` once no submission
    /// can still draw it.
    ///
    /// Buffers recorded before the next re-record stay in flight on the
    /// other slot for one more frame, so `tasks` are queued a drain late.
    pub fn release_geometry(
        &mut self,
        geometry: &RenderInfo,
        tasks: impl IntoIterator<Item = DeferredTask>,
    ) {
        self.scene.remove_geometry(geometry);
        let queue = self.deferred.clone();
        let tasks: Vec<DeferredTask> = tasks.into_iter().collect();
        self.deferred.push(DeferredTask::Run(Box::new(move || {
            for task in tasks {
                queue.push(task);
            }
        })));
    }

    /// A handle for enqueueing deferred work from elsewhere.
    pub fn deferred_queue(&self) -> DeferredTaskQueue {
        self.deferred.clone()
    }

    /// Waits for the device, runs pending deferred work and frees everything
    /// in teardown order. Idempotent.
    pub fn shutdown(&mut self) -> FrameResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.gpu.wait_idle().device("vkDeviceWaitIdle")?;
        // Tasks may enqueue follow-up tasks; run until nothing is left.
        let mut flushed = 0;
        while !self.deferred.is_empty() {
            flushed += self.deferred.drain(&self.gpu);
        }
        self.free_swapchain();
        self.providers.pipelines.release(&self.gpu);
        for uniforms in &mut self.providers.uniforms {
            uniforms.release(&self.gpu);
        }
        self.shut_down = true;
        self.enter(FrameState::Idle);
        info!(flushed, frames = self.stats.frames, "frame loop shut down");
        Ok(())
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Edits are picked up, and re-recorded, at the start of the next frame.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn swapchain(&self) -> Option<&SwapchainResources> {
        self.swapchain.as_ref()
    }

    pub fn recorder(&self) -> &CommandBufferRecorder {
        &self.recorder
    }

    pub fn images_in_flight(&self) -> &ImageInUseTable {
        &self.images_in_flight
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn config(&self) -> SwapchainConfig {
        self.config
    }

    pub fn clear_color(&self) -> ClearColor {
        self.clear
    }

    pub fn is_resize_pending(&self) -> bool {
        self.resize_pending
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> FrameResult<T>) -> FrameResult<T> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        let result = op(self);
        if let Err(e) = &result {
            error!(state = ?self.state, "frame loop failed: {e}");
            self.poisoned = true;
        }
        result
    }

    fn enter(&mut self, state: FrameState) {
        trace!(from = ?self.state, to = ?state, "frame state");
        self.state = state;
    }

    /// Polls the window until it has a drawable size.
    fn wait_for_nonzero_extent(&self) -> RenderSize {
        loop {
            let size = self.window.framebuffer_size();
            if !size.is_zero() {
                return size;
            }
            self.window.wait_events();
        }
    }

    fn rebuild_swapchain(&mut self) -> FrameResult<()> {
        let size = self.wait_for_nonzero_extent();
        self.gpu.wait_idle().device("vkDeviceWaitIdle")?;
        self.resize_pending = false;

        let old = self.swapchain.take().ok_or(FrameError::NoSwapchain)?;
        let uniforms = &mut self.providers.uniforms;
        let recorder = &mut self.recorder;
        let swapchain = old.rebuild(&self.gpu, size, self.config, |gpu| {
            for u in uniforms.iter_mut() {
                u.free(gpu);
            }
            recorder.free(gpu);
        })?;
        self.sync.destroy(&self.gpu);

        self.install_swapchain(swapchain)?;
        self.stats.rebuilds += 1;
        Ok(())
    }

    /// Creates everything keyed by the new swapchain's images, then records.
    fn install_swapchain(&mut self, swapchain: SwapchainResources) -> FrameResult<()> {
        let image_count = swapchain.image_count();
        let target = swapchain.render_target();
        self.swapchain = Some(swapchain);

        self.sync = SyncObjectPool::create(&self.gpu, MAX_FRAMES_IN_FLIGHT)?;
        self.images_in_flight.reset(image_count);
        for uniforms in &mut self.providers.uniforms {
            uniforms.create(&self.gpu, image_count)?;
        }
        self.providers.pipelines.rebuild(&self.gpu, &target)?;
        self.record()
    }

    /// Device must be idle.
    fn record(&mut self) -> FrameResult<()> {
        let swapchain = self.swapchain.as_ref().ok_or(FrameError::NoSwapchain)?;
        self.recorder.record(
            &self.gpu,
            swapchain,
            &self.scene,
            &self.providers,
            self.clear,
        )?;
        self.recorded_revision = Some(self.scene.revision());
        self.stats.records += 1;
        Ok(())
    }

    fn free_swapchain(&mut self) {
        if let Some(swapchain) = self.swapchain.take() {
            let uniforms = &mut self.providers.uniforms;
            let recorder = &mut self.recorder;
            swapchain.free(&self.gpu, |gpu| {
                for u in uniforms.iter_mut() {
                    u.free(gpu);
                }
                recorder.free(gpu);
            });
        }
        self.sync.destroy(&self.gpu);
    }
}

impl<G: Gpu> Drop for FrameLoopController<G> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("frame loop teardown failed: {e}");
        }
    }
}
