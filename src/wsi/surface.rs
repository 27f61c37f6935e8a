//! The presentation surface and capability negotiation.
//!
//! Negotiation runs once at startup and is only repeated on swapchain
//! recreation. The policy is fixed:
//! * present mode: mailbox if available, else immediate, else FIFO (the one
//!   mode the spec guarantees);
//! * color format: 8-bit BGRA SRGB when the surface offers it, else the first
//!   reported format;
//! * the surface must support transfer-source usage and the chosen format
//!   must support blit src/dst in optimal tiling; the final
//!   composition-to-swapchain blit depends on it, and absence is a fatal
//!   startup error with no software fallback.

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::instance::Instance;
use crate::core::physical_device::PhysicalDevice;
use crate::wsi::window::WindowInterface;

/// Contains all information about a [`VkSurfaceKHR`](vk::SurfaceKHR).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Surface {
    handle: vk::SurfaceKHR,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    #[derivative(Debug = "ignore")]
    functions: ash::extensions::khr::Surface,
}

impl Surface {
    /// Create a new surface for a window. Capabilities are not yet queried;
    /// call [`Surface::query_support`] once a physical device is selected.
    pub fn new(instance: &Instance, window: &dyn WindowInterface) -> Result<Self> {
        let functions =
            ash::extensions::khr::Surface::new(unsafe { instance.loader() }, instance);
        let handle = unsafe {
            ash_window::create_surface(
                instance.loader(),
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            ).map_err(Error::from)?
        };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkSurfaceKHR {:?}", handle);
        Ok(Surface {
            handle,
            capabilities: Default::default(),
            formats: vec![],
            present_modes: vec![],
            functions,
        })
    }

    /// Whether the given queue family of a device can present to this surface.
    /// # Safety
    /// `device` must be a valid physical device handle.
    pub unsafe fn supports_present(
        &self,
        device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<bool> {
        Ok(self
            .functions
            .get_physical_device_surface_support(device, queue_family, self.handle)
            .map_err(Error::from)?)
    }

    /// Query capabilities, formats and present modes, and verify the fixed
    /// requirements. Runs at startup and again on swapchain recreation.
    pub fn query_support(
        &mut self,
        instance: &Instance,
        physical_device: &PhysicalDevice,
    ) -> Result<()> {
        unsafe {
            let device = physical_device.handle();
            self.capabilities = self
                .functions
                .get_physical_device_surface_capabilities(device, self.handle)
                .map_err(Error::from)?;
            self.formats = self
                .functions
                .get_physical_device_surface_formats(device, self.handle)
                .map_err(Error::from)?;
            self.present_modes = self
                .functions
                .get_physical_device_surface_present_modes(device, self.handle)
                .map_err(Error::from)?;
        }

        if !self
            .capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_SRC)
        {
            return Err(Error::UnsupportedSurface("transfer-source usage").into());
        }
        let format = self.format()?;
        let props = unsafe {
            instance.get_physical_device_format_properties(physical_device.handle(), format.format)
        };
        if !props.optimal_tiling_features.contains(vk::FormatFeatureFlags::BLIT_SRC) {
            return Err(Error::UnsupportedSurface("blit source for the surface format").into());
        }
        if !props.optimal_tiling_features.contains(vk::FormatFeatureFlags::BLIT_DST) {
            return Err(Error::UnsupportedSurface("blit destination for the surface format").into());
        }
        info!(
            "Surface: format {:?}, present mode {:?}, {}..{} images",
            format.format,
            self.present_mode(),
            self.capabilities.min_image_count,
            self.capabilities.max_image_count,
        );
        Ok(())
    }

    /// The negotiated surface format.
    pub fn format(&self) -> Result<vk::SurfaceFormatKHR> {
        choose_surface_format(&self.formats)
    }

    /// The negotiated present mode.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        choose_present_mode(&self.present_modes)
    }

    /// The cached surface capabilities.
    pub fn capabilities(&self) -> &vk::SurfaceCapabilitiesKHR {
        &self.capabilities
    }

    /// Get unsafe access to the underlying `VkSurfaceKHR` handle.
    /// # Safety
    /// Any vulkan calls that mutate the surface may put the system in an undefined state.
    pub unsafe fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkSurfaceKHR {:?}", self.handle);
        unsafe {
            self.functions.destroy_surface(self.handle, None);
        }
    }
}

/// Preferred surface format: 8-bit BGRA with sRGB transfer.
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick the surface format: the preferred BGRA SRGB pair if the surface
/// reports it, else the first reported format.
/// # Errors
/// [`Error::NoSurfaceFormat`] if the list is empty.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    if formats.contains(&PREFERRED_FORMAT) {
        return Ok(PREFERRED_FORMAT);
    }
    formats
        .first()
        .copied()
        .ok_or_else(|| Error::NoSurfaceFormat.into())
}

/// Pick the present mode: mailbox, else immediate, else FIFO. FIFO is always
/// supported so this never fails.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    for preferred in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
        if modes.contains(&preferred) {
            return preferred;
        }
    }
    vk::PresentModeKHR::FIFO
}

/// The swapchain extent for a requested window size: the surface's current
/// extent when the platform fixes it, else the request clamped into the
/// supported range. Never produces a zero dimension as long as the surface
/// reports a non-zero minimum.
pub fn swapchain_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Swapchain image count: one more than the minimum, clamped to the reported
/// maximum (0 meaning unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count != 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNORM: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    #[test]
    fn preferred_format_wins_when_offered() {
        let formats = [UNORM, PREFERRED_FORMAT];
        assert_eq!(choose_surface_format(&formats).unwrap(), PREFERRED_FORMAT);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [UNORM];
        assert_eq!(choose_surface_format(&formats).unwrap(), UNORM);
    }

    #[test]
    fn empty_format_list_is_fatal() {
        let err = choose_surface_format(&[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoSurfaceFormat)));
    }

    #[test]
    fn present_mode_preference_chain() {
        assert_eq!(
            choose_present_mode(&[
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::IMMEDIATE,
            ]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO]), vk::PresentModeKHR::FIFO);
        // A surface reporting nothing still resolves to the guaranteed mode.
        assert_eq!(choose_present_mode(&[]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_clamps_into_the_supported_range() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        // A zero request clamps to the minimum instead of producing a
        // zero-area swapchain.
        let extent = swapchain_extent(&capabilities, 0, 0);
        assert_eq!((extent.width, extent.height), (1, 1));
        let extent = swapchain_extent(&capabilities, 8192, 16);
        assert_eq!((extent.width, extent.height), (4096, 16));
    }

    #[test]
    fn platform_fixed_extent_wins() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = swapchain_extent(&capabilities, 0, 0);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn image_count_clamps_to_reported_maximum() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
        capabilities.max_image_count = 0;
        assert_eq!(choose_image_count(&capabilities), 3);
        capabilities.min_image_count = 3;
        assert_eq!(choose_image_count(&capabilities), 4);
    }
}
