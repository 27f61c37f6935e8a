//! CPU-GPU and GPU-GPU synchronization primitives.
//!
//! The engine owns one [`FrameSync`] set for its whole lifetime: the fences are
//! reset every frame and nothing here is destroyed until shutdown, after a full
//! device-idle wait.

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;

/// Wrapper around a [`VkFence`](vk::Fence) object. Fences are used for CPU-GPU sync.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Fence {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Fence,
}

impl Fence {
    /// Create a new fence, possibly in the signaled state.
    pub fn new(device: Device, signaled: bool) -> Result<Self> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            p_next: std::ptr::null(),
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
        };
        let handle = unsafe { device.create_fence(&info, None).map_err(crate::Error::from)? };
        Ok(Fence {
            device,
            handle,
        })
    }

    /// Block until the fence is signaled. The wait is unbounded; completion is
    /// bounded by the GPU finishing the submission that signals this fence.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(std::slice::from_ref(&self.handle), true, u64::MAX)
                .map_err(crate::Error::from)?
        };
        Ok(())
    }

    /// Reset the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .reset_fences(std::slice::from_ref(&self.handle))
                .map_err(crate::Error::from)?
        };
        Ok(())
    }

    /// Wait for the fence, then reset it for the next frame.
    pub fn wait_and_reset(&self) -> Result<()> {
        self.wait()?;
        self.reset()
    }

    /// The raw fence handle, for submit infos.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.handle, None);
        }
    }
}

/// Wrapper around a [`VkSemaphore`](vk::Semaphore) object. Semaphores are used for GPU-GPU sync.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Semaphore {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a new `VkSemaphore` object.
    pub fn new(device: Device) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.create_semaphore(&info, None).map_err(crate::Error::from)? };
        Ok(Semaphore {
            device,
            handle,
        })
    }

    /// The raw semaphore handle, for submit and present infos.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

/// The per-frame synchronization set.
///
/// `acquire` is signaled by the presentation engine when the swapchain hands
/// back an image. `shadows` is signaled by the shadow submission on frames
/// where shadow casting is enabled; the deferred submission waits on whichever
/// of the two applies. `rendered` gates presentation, and `frame` bounds how
/// far the CPU can run ahead: it is waited on and reset at the end of every
/// frame, keeping exactly one frame in flight.
#[derive(Debug)]
pub struct FrameSync {
    pub acquire: Semaphore,
    pub shadows: Semaphore,
    pub rendered: Semaphore,
    pub frame: Fence,
    pub compute: Fence,
}

impl FrameSync {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(FrameSync {
            acquire: Semaphore::new(device.clone())?,
            shadows: Semaphore::new(device.clone())?,
            rendered: Semaphore::new(device.clone())?,
            frame: Fence::new(device.clone(), false)?,
            compute: Fence::new(device.clone(), false)?,
        })
    }
}
