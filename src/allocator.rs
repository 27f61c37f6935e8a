//! Device memory allocation, backed by the [`gpu_allocator`] crate.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan as vk_alloc;
use gpu_allocator::vulkan::AllocationScheme;
pub use gpu_allocator::MemoryLocation;

use crate::core::device::Device;
use crate::core::error::Error;
use crate::core::instance::Instance;
use crate::core::physical_device::PhysicalDevice;

pub use gpu_allocator::vulkan::Allocation;

/// Clonable wrapper over the gpu-allocator allocator. All internal state is
/// behind an `Arc<Mutex>` so it can be handed to every resource constructor.
///
/// Allocation failure (no memory type satisfies the request, or the heap is
/// exhausted) is fatal to whatever operation triggered it; there is no retry
/// or fallback path.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Allocator {
    #[derivative(Debug = "ignore")]
    alloc: Arc<Mutex<vk_alloc::Allocator>>,
}

impl Allocator {
    /// Create the allocator for a device.
    pub fn new(
        instance: &Instance,
        device: &Device,
        physical_device: &PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            alloc: Arc::new(Mutex::new(
                vk_alloc::Allocator::new(&vk_alloc::AllocatorCreateDesc {
                    instance: (**instance).clone(),
                    // SAFETY: The caller passed valid device references.
                    device: unsafe { device.handle() },
                    physical_device: unsafe { physical_device.handle() },
                    debug_settings: Default::default(),
                    buffer_device_address: false,
                })
                .map_err(Error::from)?,
            )),
        })
    }

    /// Allocate memory for the given requirements. The returned allocation is
    /// at least `requirements.size` bytes, which may exceed what the caller
    /// asked the resource for.
    pub fn allocate(
        &self,
        name: &str,
        requirements: &vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        let mut alloc = self.alloc.lock().map_err(|_| Error::Uncategorized("Poisoned allocator lock"))?;
        Ok(alloc
            .allocate(&vk_alloc::AllocationCreateDesc {
                name,
                requirements: *requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(Error::from)?)
    }

    /// Return an allocation to the allocator.
    pub fn free(&self, allocation: Allocation) -> Result<()> {
        let mut alloc = self.alloc.lock().map_err(|_| Error::Uncategorized("Poisoned allocator lock"))?;
        alloc.free(allocation).map_err(Error::from)?;
        Ok(())
    }
}
