//! Wrapper around a `VkDevice`.

use std::ffi::CString;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::core::instance::Instance;
use crate::core::physical_device::{PhysicalDevice, QueueFamilies};

#[derive(Derivative)]
#[derivative(Debug)]
struct DeviceInner {
    #[derivative(Debug = "ignore")]
    handle: ash::Device,
    queue_families: QueueFamilies,
    properties: vk::PhysicalDeviceProperties,
}

/// Wrapper around a `VkDevice`. The device provides access to almost the entire
/// Vulkan API. Internal state is wrapped in an `Arc`, so this is safe and cheap
/// to clone; every component that needs device access stores a clone instead of
/// reaching for shared global state.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create the logical device with one queue per unique family and the
    /// swapchain extension enabled.
    pub fn new(instance: &Instance, physical_device: &PhysicalDevice) -> Result<Self> {
        let priority = [1.0f32];
        let families = physical_device.queue_families();
        let queue_create_infos = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priority)
                    .build()
            })
            .collect::<Vec<_>>();

        let extension_names = vec![CString::from(ash::extensions::khr::Swapchain::name())];
        info!("Enabled device extensions:");
        for ext in &extension_names {
            info!("{:?}", ext);
        }
        let extension_names_raw = extension_names.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };

        let info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(queue_create_infos.as_slice())
            .enabled_extension_names(extension_names_raw.as_slice())
            .enabled_features(&features);

        let handle = unsafe {
            instance.create_device(physical_device.handle(), &info, None).map_err(crate::Error::from)?
        };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkDevice {:p}", handle.handle());

        Ok(Device {
            inner: Arc::new(DeviceInner {
                handle,
                queue_families: families,
                properties: *physical_device.properties(),
            }),
        })
    }

    /// Get unsafe access to the underlying `VkDevice` handle.
    /// # Safety
    /// Destroying this handle or calling `vkDeviceWaitIdle` concurrently with
    /// queue submissions puts the system in an undefined state.
    pub unsafe fn handle(&self) -> ash::Device {
        self.inner.handle.clone()
    }

    /// The queue families the device was created with.
    pub fn queue_families(&self) -> QueueFamilies {
        self.inner.queue_families
    }

    /// Properties of the physical device this device was created from.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.inner.properties
    }

    /// Block until the device has completed all pending work. Used at shutdown
    /// and before any resize teardown so no in-flight command buffer can
    /// reference a freed resource.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.inner.handle.device_wait_idle().map_err(crate::Error::from)? };
        Ok(())
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.inner.handle
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkDevice {:p}", self.handle.handle());
        unsafe {
            self.handle.destroy_device(None);
        }
    }
}
