// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use tracing::debug;

use crate::error::{DeviceContext, FrameError, FrameResult};
use crate::gpu::Gpu;

/// Synchronization for one frame in flight.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    /// Signaled by acquire, waited on by submit.
    pub image_available: vk::Semaphore,
    /// Signaled by submit, waited on by present.
    pub render_finished: vk::Semaphore,
    /// Signaled when the slot's last submission retires.
    pub in_flight: vk::Fence,
}

/// The fixed set of [`FrameSlot`]s cycled by the frame loop.
///
/// Fences start signaled so the first wait on every slot returns at once.
#[derive(Debug, Default)]
pub struct SyncObjectPool {
    slots: Vec<FrameSlot>,
}

impl SyncObjectPool {
    pub fn create<G: Gpu>(gpu: &G, count: usize) -> FrameResult<Self> {
        let mut pool = Self {
            slots: Vec::with_capacity(count),
        };
        for _ in 0..count {
            match Self::create_slot(gpu) {
                Ok(slot) => pool.slots.push(slot),
                Err(e) => {
                    pool.destroy(gpu);
                    return Err(e);
                }
            }
        }
        debug!(slots = count, "sync objects created");
        Ok(pool)
    }

    fn create_slot<G: Gpu>(gpu: &G) -> FrameResult<FrameSlot> {
        let image_available = gpu.create_semaphore().device("vkCreateSemaphore")?;
        let render_finished = match gpu.create_semaphore().device("vkCreateSemaphore") {
            Ok(s) => s,
            Err(e) => {
                gpu.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        let in_flight = match gpu.create_fence(true).device("vkCreateFence") {
            Ok(f) => f,
            Err(e) => {
                gpu.destroy_semaphore(render_finished);
                gpu.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        Ok(FrameSlot {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Caller guarantees none of the fences guard in-flight work.
    pub fn destroy<G: Gpu>(&mut self, gpu: &G) {
        for slot in self.slots.drain(..) {
            gpu.destroy_semaphore(slot.render_finished);
            gpu.destroy_semaphore(slot.image_available);
            gpu.destroy_fence(slot.in_flight);
        }
    }

    pub fn slot(&self, index: usize) -> FrameResult<&FrameSlot> {
        self.slots.get(index).ok_or_else(|| {
            FrameError::invariant(format!(
                "frame slot {index} out of range ({} slots)",
                self.slots.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Which frame slot last submitted work targeting each swapchain image.
#[derive(Debug, Default)]
pub struct ImageInUseTable {
    owners: Vec<Option<usize>>,
}

impl ImageInUseTable {
    /// Forgets all owners. Called whenever the image set changes.
    pub fn reset(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }

    /// Records `slot` as the owner of `image`, returning the previous owner.
    pub fn claim(&mut self, image: usize, slot: usize) -> FrameResult<Option<usize>> {
        let count = self.owners.len();
        let owner = self.owners.get_mut(image).ok_or_else(|| {
            FrameError::invariant(format!("image {image} out of range ({count} images)"))
        })?;
        Ok(owner.replace(slot))
    }

    pub fn owner(&self, image: usize) -> Option<usize> {
        self.owners.get(image).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
