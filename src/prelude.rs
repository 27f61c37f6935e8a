//! Re-exports the most commonly used types of the crate.

pub use ash::vk;

pub use crate::allocator::Allocator;
pub use crate::camera::CameraState;
pub use crate::core::device::Device;
pub use crate::core::error::Error;
pub use crate::core::instance::Instance;
pub use crate::core::physical_device::PhysicalDevice;
pub use crate::core::queue::Queues;
pub use crate::core::DeviceContext;
pub use crate::descriptor::{DescriptorBinder, DescriptorWriter, SetLayout};
pub use crate::graph::FrameGraph;
pub use crate::pass::{DrawList, MeshRange, ModelDraw, PassDecl, PassModule};
pub use crate::renderer::{FramePlan, RenderSettings, Renderer};
pub use crate::resource::buffer::{Buffer, MappedBuffer};
pub use crate::resource::image::{Image, ImageCreateInfo, LayoutState};
pub use crate::resource::pipeline::{Pipeline, PipelineBuilder};
pub use crate::resource::render_pass::{Framebuffer, RenderPass};
pub use crate::shaders::ShaderSet;
pub use crate::sync::{Fence, Semaphore};
pub use crate::targets::RenderTargetTable;
pub use crate::upload::UploadQueue;
pub use crate::wsi::surface::Surface;
pub use crate::wsi::swapchain::Swapchain;
pub use crate::wsi::window::WindowInterface;
