//! Physical device selection.
//!
//! The engine needs one GPU with a graphics-capable queue family, a
//! compute-capable queue family (may be the same) and presentation support for
//! the target surface. Nothing is negotiated beyond that; a machine that cannot
//! satisfy these requirements is a fatal setup error.

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::instance::Instance;
use crate::wsi::surface::Surface;

/// Queue family indices chosen at device selection time.
#[derive(Debug, Copy, Clone)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Deduplicated list of family indices, for queue create infos and
    /// concurrent sharing setups.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        if !families.contains(&self.compute) {
            families.push(self.compute);
        }
        if !families.contains(&self.present) {
            families.push(self.present);
        }
        families
    }
}

/// A selected physical device together with its cached properties.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    queue_families: QueueFamilies,
}

impl PhysicalDevice {
    /// Select a physical device that can render and present to `surface`.
    /// Discrete GPUs are preferred over integrated ones.
    /// # Errors
    /// * [`Error::NoGpu`] if no device exposes graphics + compute + present.
    pub fn select(instance: &Instance, surface: &Surface) -> Result<Self> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        let mut best: Option<PhysicalDevice> = None;
        for device in devices {
            let Some(families) = Self::find_queue_families(instance, device, surface)? else {
                continue;
            };
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let memory_properties =
                unsafe { instance.get_physical_device_memory_properties(device) };
            let candidate = PhysicalDevice {
                handle: device,
                properties,
                memory_properties,
                queue_families: families,
            };
            let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            match &best {
                Some(chosen)
                    if chosen.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU => {}
                _ if discrete => best = Some(candidate),
                None => best = Some(candidate),
                _ => {}
            }
        }

        let device = best.ok_or(Error::NoGpu)?;
        info!(
            "Selected physical device {:?} (graphics family {}, compute family {}, present family {})",
            unsafe { std::ffi::CStr::from_ptr(device.properties.device_name.as_ptr()) },
            device.queue_families.graphics,
            device.queue_families.compute,
            device.queue_families.present,
        );
        Ok(device)
    }

    fn find_queue_families(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: &Surface,
    ) -> Result<Option<QueueFamilies>> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut graphics = None;
        let mut compute = None;
        let mut present = None;
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(index);
            }
            // Prefer a compute family distinct from the graphics family so the
            // animation pre-pass gets its own queue.
            if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && (compute.is_none() || Some(index) != graphics)
            {
                compute = Some(index);
            }
            if present.is_none() && unsafe { surface.supports_present(device, index)? } {
                present = Some(index);
            }
        }
        Ok(match (graphics, compute, present) {
            (Some(graphics), Some(compute), Some(present)) => Some(QueueFamilies {
                graphics,
                compute,
                present,
            }),
            _ => None,
        })
    }

    /// Get unsafe access to the underlying `VkPhysicalDevice`.
    /// # Safety
    /// The caller must not destroy or reconfigure the device through this handle.
    pub unsafe fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    /// Cached device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Cached memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// The queue families the device was selected with.
    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }
}
