// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The device rejected a call with something other than out-of-date/suboptimal.
    #[error("{op} failed: {result}")]
    Device {
        op: &'static str,
        #[source]
        result: vk::Result,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("no swapchain has been built")]
    NoSwapchain,

    #[error("renderer is unusable after an earlier fatal error")]
    Poisoned,

    /// A pipeline or uniform provider failed.
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Tags a raw device result with the operation that produced it.
pub(crate) trait DeviceContext<T> {
    fn device(self, op: &'static str) -> FrameResult<T>;
}

impl<T> DeviceContext<T> for Result<T, vk::Result> {
    fn device(self, op: &'static str) -> FrameResult<T> {
        self.map_err(|result| FrameError::Device { op, result })
    }
}

impl FrameError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        FrameError::Invariant(msg.into())
    }
}
