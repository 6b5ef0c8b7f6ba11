//! Fences, semaphores and per-frame synchronization.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::resources::{GpuResource, InFlight};
use ash::vk;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A CPU-waitable fence.
///
/// Each reset starts a new epoch. Submissions remember the epoch they were
/// signalled in, so a submission whose fence has since been reset is known to
/// have completed.
pub struct Fence {
    device: Arc<Device>,
    raw: vk::Fence,
    epoch: AtomicU64,
    pending: AtomicBool,
}

impl Fence {
    pub fn new(device: Arc<Device>, start_signaled: bool) -> Result<Arc<Self>> {
        let flags = if start_signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let raw = unsafe { device.raw().create_fence(&create_info, None)? };
        Ok(Arc::new(Self {
            device,
            raw,
            epoch: AtomicU64::new(0),
            pending: AtomicBool::new(false),
        }))
    }

    pub fn raw(&self) -> vk::Fence {
        self.raw
    }

    /// Current epoch, incremented by every [`Fence::reset`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Block until signalled or `timeout_ns` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.raw().wait_for_fences(&[self.raw], true, timeout_ns) } {
            Ok(()) => {
                self.pending.store(false, Ordering::Release);
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_signaled(&self) -> Result<bool> {
        let signaled = unsafe { self.device.raw().get_fence_status(self.raw)? };
        if signaled {
            self.pending.store(false, Ordering::Release);
        }
        Ok(signaled)
    }

    /// Return the fence to the unsignalled state.
    ///
    /// Fails if a submission that signals this fence has not completed yet.
    pub fn reset(&self) -> Result<()> {
        if self.pending.load(Ordering::Acquire) && !self.is_signaled()? {
            let error = GpuError::InvalidState("fence reset while its submission is pending".to_string());
            tracing::error!(parent: self.device.logger().span(), %error, "fence reset refused");
            return Err(error);
        }
        unsafe { self.device.raw().reset_fences(&[self.raw])? };
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Record that a submission will signal this fence.
    pub(crate) fn mark_submitted(self: &Arc<Self>) -> SubmissionToken {
        self.pending.store(true, Ordering::Release);
        SubmissionToken {
            fence: Arc::clone(self),
            epoch: self.epoch(),
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_fence(self.raw, None) };
    }
}

/// Identifies one submission's signal of a fence.
#[derive(Clone)]
pub struct SubmissionToken {
    fence: Arc<Fence>,
    epoch: u64,
}

impl SubmissionToken {
    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Whether the GPU has finished the submission.
    pub fn is_complete(&self) -> Result<bool> {
        if self.fence.epoch() != self.epoch {
            return Ok(true);
        }
        self.fence.is_signaled()
    }

    /// Block until the submission completes. Returns `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        if self.fence.epoch() != self.epoch {
            return Ok(true);
        }
        self.fence.wait(timeout_ns)
    }
}

/// A binary semaphore for GPU-GPU ordering.
///
/// Every signal must be consumed by exactly one wait before the semaphore is
/// signalled again. This is not checked.
pub struct Semaphore {
    device: Arc<Device>,
    raw: vk::Semaphore,
    in_flight: InFlight,
}

impl Semaphore {
    pub fn new(device: Arc<Device>) -> Result<Arc<Self>> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let raw = unsafe { device.raw().create_semaphore(&create_info, None)? };
        Ok(Arc::new(Self {
            device,
            raw,
            in_flight: InFlight::default(),
        }))
    }

    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

impl GpuResource for Semaphore {
    fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn debug_name(&self) -> &str {
        "semaphore"
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        crate::resources::check_idle_on_drop(&*self, self.device.logger());
        unsafe { self.device.raw().destroy_semaphore(self.raw, None) };
    }
}

/// Synchronization objects for one frame in flight.
pub struct FrameSync {
    /// Signalled when the swapchain image is available.
    pub image_available: Arc<Semaphore>,
    /// Signalled when rendering is complete.
    pub render_finished: Arc<Semaphore>,
    /// Signalled when the frame's submission completes. Created signalled.
    pub in_flight: Arc<Fence>,
}

impl FrameSync {
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(Arc::clone(device))?,
            render_finished: Semaphore::new(Arc::clone(device))?,
            in_flight: Fence::new(Arc::clone(device), true)?,
        })
    }

    /// Wait for the previous use of this frame to finish.
    pub fn wait(&self) -> Result<()> {
        self.in_flight.wait(u64::MAX)?;
        Ok(())
    }
}

/// Rotates through a fixed number of [`FrameSync`]s.
pub struct FrameSyncRing {
    frames: Vec<FrameSync>,
    current: usize,
}

impl FrameSyncRing {
    pub fn new(device: &Arc<Device>, frames_in_flight: usize) -> Result<Self> {
        let frames = (0..frames_in_flight.max(1))
            .map(|_| FrameSync::new(device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { frames, current: 0 })
    }

    pub fn current(&self) -> &FrameSync {
        &self.frames[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.frames.len();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
