//! Exposes the Vulkan instance, which represents the loaded Vulkan library.

use std::ffi::{CStr, CString};
use std::ops::Deref;
use std::str::FromStr;

use anyhow::Result;
use ash::vk;
use raw_window_handle::HasRawDisplayHandle;

use crate::wsi::window::WindowInterface;

/// Settings used to create the Vulkan instance.
#[derive(Debug, Default, Clone)]
pub struct InstanceSettings {
    /// Name reported to the driver as the application name.
    pub app_name: String,
    /// Enable the Khronos validation layer and the debug-utils messenger.
    pub validation: bool,
}

/// Represents the loaded Vulkan instance.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Instance {
    #[derivative(Debug = "ignore")]
    entry: ash::Entry,
    #[derivative(Debug = "ignore")]
    instance: ash::Instance,
}

impl Instance {
    /// Initializes the Vulkan API and creates an instance able to present to
    /// the given window's display.
    /// # Errors
    /// * Fails if the Vulkan loader was not found. Check for valid Vulkan drivers.
    /// * Fails if a requested layer or extension is unsupported, e.g. when
    ///   validation is requested but the Vulkan SDK is not installed.
    pub fn new(settings: &InstanceSettings, window: &dyn WindowInterface) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().map_err(crate::Error::from)? };
        let instance = create_vk_instance(&entry, settings, window)?;
        #[cfg(feature = "log-objects")]
        trace!("Created new VkInstance {:p}", instance.handle());
        Ok(Instance {
            entry,
            instance,
        })
    }

    /// Get unsafe access to the vulkan entry point.
    /// # Safety
    /// Any vulkan calls that modify the system's state may put the system in an undefined state.
    pub unsafe fn loader(&self) -> &ash::Entry {
        &self.entry
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkInstance {:p}", self.instance.handle());
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

fn create_vk_instance(
    entry: &ash::Entry,
    settings: &InstanceSettings,
    window: &dyn WindowInterface,
) -> Result<ash::Instance> {
    let app_name = CString::new(settings.app_name.clone()).map_err(crate::Error::from)?;
    let engine_name = CString::new("Deimos").unwrap();
    let app_info = vk::ApplicationInfo {
        api_version: vk::make_api_version(0, 1, 2, 0),
        p_application_name: app_name.as_ptr(),
        p_engine_name: engine_name.as_ptr(),
        engine_version: vk::make_api_version(
            0,
            u32::from_str(env!("CARGO_PKG_VERSION_MAJOR")).unwrap(),
            u32::from_str(env!("CARGO_PKG_VERSION_MINOR")).unwrap(),
            u32::from_str(env!("CARGO_PKG_VERSION_PATCH")).unwrap(),
        ),
        ..Default::default()
    };

    let mut layers = Vec::<CString>::new();
    let mut extensions = Vec::<CString>::new();

    if settings.validation {
        layers.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        extensions.push(CString::from(ash::extensions::ext::DebugUtils::name()));
    }

    extensions.extend(
        ash_window::enumerate_required_extensions(window.raw_display_handle())?
            .iter()
            .map(|&raw_str| unsafe { CString::from(CStr::from_ptr(raw_str)) }),
    );

    info!("Enabled instance extensions:");
    for ext in &extensions {
        info!("{:?}", ext);
    }

    let layers_raw = layers.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();
    let extensions_raw = extensions.iter().map(|s| s.as_ptr()).collect::<Vec<_>>();

    let instance_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(layers_raw.as_slice())
        .enabled_extension_names(extensions_raw.as_slice());

    Ok(unsafe { entry.create_instance(&instance_info, None).map_err(crate::Error::from)? })
}
