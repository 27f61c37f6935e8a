//! The swapchain: presentable images cycled between rendering and display.

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;
use crate::core::error::Error;
use crate::core::instance::Instance;
use crate::resource::image::Image;
use crate::wsi::surface::{choose_image_count, Surface};

/// Wrapper around a [`VkSwapchainKHR`](vk::SwapchainKHR) and its images.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<Image>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    #[derivative(Debug = "ignore")]
    functions: ash::extensions::khr::Swapchain,
}

impl Swapchain {
    /// Create a new swapchain using the surface's negotiated format and
    /// present mode.
    pub fn new(
        instance: &Instance,
        device: Device,
        surface: &Surface,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let functions = ash::extensions::khr::Swapchain::new(instance, &device);
        Self::create(device, functions, surface, extent, vk::SwapchainKHR::null())
    }

    /// Create a replacement swapchain at a new extent, handing the old
    /// swapchain to the driver. The old object must still be destroyed by the
    /// caller (by dropping `self` after this returns).
    pub fn recreate(&self, device: Device, surface: &Surface, extent: vk::Extent2D) -> Result<Self> {
        Self::create(device, self.functions.clone(), surface, extent, self.handle)
    }

    fn create(
        device: Device,
        functions: ash::extensions::khr::Swapchain,
        surface: &Surface,
        extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let format = surface.format()?;
        let present_mode = surface.present_mode();
        let capabilities = surface.capabilities();
        let image_count = choose_image_count(capabilities);

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(unsafe { surface.handle() })
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { functions.create_swapchain(&info, None).map_err(Error::from)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkSwapchainKHR {:?}", handle);

        let images = unsafe { functions.get_swapchain_images(handle).map_err(Error::from)? }
            .into_iter()
            .map(|image| {
                Image::new_managed(device.clone(), image, format.format, extent.width, extent.height)
            })
            .collect::<Result<Vec<Image>>>()?;
        info!(
            "Swapchain: {} images, {}x{}, {:?}",
            images.len(),
            extent.width,
            extent.height,
            present_mode
        );

        Ok(Swapchain {
            handle,
            images,
            format,
            present_mode,
            extent,
            functions,
        })
    }

    /// Acquire the next presentable image, blocking for as long as the
    /// presentation engine needs. Signals `semaphore` when the image is ready
    /// to be written. Returns the image index and whether the swapchain is out
    /// of date and must be recreated.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        let result = unsafe {
            self.functions.acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };
        match result {
            // A suboptimal swapchain still presents correctly; keep going.
            Ok((index, _suboptimal)) => Ok((index, false)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, true)),
            Err(err) => Err(Error::from(err).into()),
        }
    }

    /// Present the given image once `wait` is signaled.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(std::slice::from_ref(&wait))
            .swapchains(std::slice::from_ref(&self.handle))
            .image_indices(std::slice::from_ref(&image_index));
        let result = unsafe { self.functions.queue_present(queue, &info).map(|_| ()) };
        match result {
            Ok(()) => Ok(()),
            // A resize is already on its way; dropping one present is fine.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(()),
            Err(err) => Err(Error::from(err).into()),
        }
    }

    /// The swapchain images.
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Mutable access to a swapchain image, for layout transitions during the
    /// final blit path.
    pub fn image_mut(&mut self, index: u32) -> &mut Image {
        &mut self.images[index as usize]
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// The swapchain image format.
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// The swapchain image size.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // The image views must go before the swapchain handle.
        self.images.clear();
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkSwapchainKHR {:?}", self.handle);
        unsafe {
            self.functions.destroy_swapchain(self.handle, None);
        }
    }
}
