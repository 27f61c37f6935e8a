//! Render pass and framebuffer wrappers.
//!
//! Every pass module owns one [`RenderPass`] per GPU render pass it records,
//! and one [`Framebuffer`] per swapchain image (render targets are shared
//! between in-flight frames only because a single frame is in flight; the
//! per-image framebuffers avoid write-after-read hazards on the swapchain
//! attachment itself).

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;

/// Describes a single attachment of a render pass.
#[derive(Debug, Copy, Clone)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    /// Layout the attachment is left in when the pass ends.
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// A cleared color attachment left in shader-read layout, the shape used
    /// by every offscreen render target.
    pub fn color(format: vk::Format) -> Self {
        AttachmentDesc {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// A cleared swapchain attachment left ready for presentation.
    pub fn present(format: vk::Format) -> Self {
        AttachmentDesc {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

/// Wrapper around a [`VkRenderPass`](vk::RenderPass) with a single subpass.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RenderPass {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::RenderPass,
    color_count: u32,
}

impl RenderPass {
    /// Create a render pass over the given color attachments and an optional
    /// depth attachment. The depth attachment is cleared and left in
    /// shader-read layout so consumer passes can sample it.
    pub fn new(
        device: Device,
        colors: &[AttachmentDesc],
        depth: Option<vk::Format>,
    ) -> Result<Self> {
        let mut attachments = colors
            .iter()
            .map(|desc| vk::AttachmentDescription {
                flags: Default::default(),
                format: desc.format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: desc.load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: desc.final_layout,
            })
            .collect::<Vec<_>>();

        let color_refs = (0..colors.len() as u32)
            .map(|index| vk::AttachmentReference {
                attachment: index,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect::<Vec<_>>();

        let depth_ref = depth.map(|format| {
            attachments.push(vk::AttachmentDescription {
                flags: Default::default(),
                format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            });
            vk::AttachmentReference {
                attachment: colors.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_refs.as_slice());
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpass = subpass.build();

        // External dependencies ordering this pass against the prior reader
        // and the next sampler of its attachments; Vulkan's implicit
        // dependencies do not cover the write-then-sample hazard.
        let mut write_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut write_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth.is_some() {
            write_stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            write_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: write_stages,
                src_access_mask: vk::AccessFlags::SHADER_READ,
                dst_access_mask: write_access,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: write_stages,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: write_access,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];

        let info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments.as_slice())
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);

        let handle = unsafe { device.create_render_pass(&info, None).map_err(crate::Error::from)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkRenderPass {:?}", handle);
        Ok(RenderPass {
            device,
            handle,
            color_count: colors.len() as u32,
        })
    }

    /// Create a depth-only render pass, used for shadow map rendering. The
    /// attachment ends in shader-read layout so the composition pass can
    /// sample the cascade.
    pub fn new_depth_only(device: Device, format: vk::Format) -> Result<Self> {
        let attachment = vk::AttachmentDescription {
            flags: Default::default(),
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .depth_stencil_attachment(&depth_ref)
            .build();
        let depth_stages = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: depth_stages,
                src_access_mask: vk::AccessFlags::SHADER_READ,
                dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: depth_stages,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                dependency_flags: vk::DependencyFlags::BY_REGION,
            },
        ];
        let info = vk::RenderPassCreateInfo::builder()
            .attachments(std::slice::from_ref(&attachment))
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        let handle = unsafe { device.create_render_pass(&info, None).map_err(crate::Error::from)? };
        Ok(RenderPass {
            device,
            handle,
            color_count: 0,
        })
    }

    /// Get unsafe access to the underlying `VkRenderPass` handle.
    /// # Safety
    /// The caller must not destroy the handle.
    pub unsafe fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// The number of color attachments the pass was created with.
    pub fn color_count(&self) -> u32 {
        self.color_count
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkRenderPass {:?}", self.handle);
        unsafe {
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}

/// Wrapper around a [`VkFramebuffer`](vk::Framebuffer).
///
/// A framebuffer must be destroyed before the render pass and image views it
/// was created from; pass modules guarantee this by dropping their framebuffer
/// vectors before their render passes on teardown and resize.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Framebuffer {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::Framebuffer,
    width: u32,
    height: u32,
}

impl Framebuffer {
    /// Create a framebuffer over the given attachment views.
    pub fn new(
        device: Device,
        render_pass: &RenderPass,
        views: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(unsafe { render_pass.handle() })
            .attachments(views)
            .width(width)
            .height(height)
            .layers(1);
        let handle = unsafe { device.create_framebuffer(&info, None).map_err(crate::Error::from)? };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkFramebuffer {:?} ({}x{})", handle, width, height);
        Ok(Framebuffer {
            device,
            handle,
            width,
            height,
        })
    }

    /// Get unsafe access to the underlying `VkFramebuffer` handle.
    /// # Safety
    /// The caller must not destroy the handle.
    pub unsafe fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    /// The render area covering the whole framebuffer.
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: 0,
                y: 0,
            },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkFramebuffer {:?}", self.handle);
        unsafe {
            self.device.destroy_framebuffer(self.handle, None);
        }
    }
}
