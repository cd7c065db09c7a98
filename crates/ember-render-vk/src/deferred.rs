// SPDX-License-Identifier: CEPL-1.0
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;

use crate::gpu::Gpu;

/// Work that must wait until the GPU can no longer be reading what it touches.
pub enum DeferredTask {
    DestroyBuffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    },
    DestroyImage {
        image: vk::Image,
        view: vk::ImageView,
        memory: vk::DeviceMemory,
    },
    Run(Box<dyn FnOnce() + Send>),
}

impl DeferredTask {
    pub fn run<G: Gpu + ?Sized>(self, gpu: &G) {
        match self {
            DeferredTask::DestroyBuffer { buffer, memory } => {
                gpu.destroy_buffer(buffer);
                if memory != vk::DeviceMemory::null() {
                    gpu.free_memory(memory);
                }
            }
            DeferredTask::DestroyImage {
                image,
                view,
                memory,
            } => {
                if view != vk::ImageView::null() {
                    gpu.destroy_image_view(view);
                }
                gpu.destroy_image(image);
                if memory != vk::DeviceMemory::null() {
                    gpu.free_memory(memory);
                }
            }
            DeferredTask::Run(f) => f(),
        }
    }
}

impl fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredTask::DestroyBuffer { buffer, memory } => f
                .debug_struct("DestroyBuffer")
                .field("buffer", buffer)
                .field("memory", memory)
                .finish(),
            DeferredTask::DestroyImage {
                image,
                view,
                memory,
            } => f
                .debug_struct("DestroyImage")
                .field("image", image)
                .field("view", view)
                .field("memory", memory)
                .finish(),
            DeferredTask::Run(_) => f.write_str("Run(..)"),
        }
    }
}

/// FIFO of [`DeferredTask`]s. Clones share the same queue, so anything
/// holding one can enqueue from any thread.
#[derive(Clone, Default)]
pub struct DeferredTaskQueue {
    tasks: Arc<Mutex<VecDeque<DeferredTask>>>,
}

impl DeferredTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: DeferredTask) {
        self.lock().push_back(task);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs everything queued so far, oldest first, and returns how many ran.
    /// The lock is not held while tasks run; tasks queued meanwhile wait for
    /// the next drain.
    pub fn drain<G: Gpu + ?Sized>(&self, gpu: &G) -> usize {
        let batch = std::mem::take(&mut *self.lock());
        let count = batch.len();
        for task in batch {
            task.run(gpu);
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeferredTask>> {
        // A task panicking elsewhere leaves the queue itself intact.
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DeferredTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpu;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> DeferredTask {
        let log = Arc::clone(log);
        DeferredTask::Run(Box::new(move || log.lock().unwrap().push(id)))
    }

    #[test]
    fn drain_runs_in_enqueue_order_and_empties() {
        let gpu = MockGpu::new(2, 3);
        let queue = DeferredTaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 1..=3 {
            queue.push(record(&log, id));
        }

        assert_eq!(queue.drain(&gpu), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.drain(&gpu), 0);
    }

    #[test]
    fn tasks_queued_while_draining_wait_for_the_next_drain() {
        let gpu = MockGpu::new(2, 3);
        let queue = DeferredTaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let handle = queue.clone();
        let inner_ran = Arc::clone(&ran);
        queue.push(DeferredTask::Run(Box::new(move || {
            let inner_ran = Arc::clone(&inner_ran);
            handle.push(DeferredTask::Run(Box::new(move || {
                inner_ran.fetch_add(1, Ordering::SeqCst);
            })));
        })));

        assert_eq!(queue.drain(&gpu), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain(&gpu), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_tasks_release_through_the_device() {
        let gpu = MockGpu::new(2, 3);
        let queue = DeferredTaskQueue::new();
        queue.push(DeferredTask::DestroyBuffer {
            buffer: vk::Buffer::from_raw(7),
            memory: vk::DeviceMemory::from_raw(8),
        });
        queue.push(DeferredTask::DestroyImage {
            image: vk::Image::from_raw(9),
            view: vk::ImageView::null(),
            memory: vk::DeviceMemory::null(),
        });
        queue.drain(&gpu);

        assert_eq!(
            gpu.state().log,
            vec!["destroy buffer 7", "free memory 8", "destroy image 9"]
        );
    }

    #[test]
    fn queue_is_shareable_across_threads() {
        let queue = DeferredTaskQueue::new();
        let remote = queue.clone();
        std::thread::spawn(move || remote.push(DeferredTask::Run(Box::new(|| {}))))
            .join()
            .unwrap();
        assert_eq!(queue.len(), 1);
    }
}
