//! Descriptor set management.
//!
//! The [`DescriptorBinder`] owns the descriptor pool. Every pass module builds
//! its set layouts and allocates its sets once at setup; when a bound resource
//! changes (render targets after a resize), the same sets are rewritten in
//! place through a [`DescriptorWriter`] rather than reallocated.

use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::core::device::Device;
use crate::resource::buffer::Buffer;
use crate::resource::image::Image;

/// A descriptor set layout shared between the pipelines and sets built from
/// it. `Arc` ownership means the last owner deallocates the Vulkan handle.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SetLayout {
    #[derivative(Debug = "ignore")]
    device: Device,
    handle: vk::DescriptorSetLayout,
}

impl SetLayout {
    /// Get unsafe access to the underlying `VkDescriptorSetLayout` handle.
    /// # Safety
    /// The caller must not destroy the handle.
    pub unsafe fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for SetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

/// A single binding in a set layout: binding index, descriptor type, and the
/// shader stages that access it.
pub type LayoutBinding = (u32, vk::DescriptorType, vk::ShaderStageFlags);

/// Owns the descriptor pool and allocates descriptor sets for pass modules.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DescriptorBinder {
    #[derivative(Debug = "ignore")]
    device: Device,
    pool: vk::DescriptorPool,
}

impl DescriptorBinder {
    /// Create a pool sized for the engine's pass modules.
    pub fn new(device: Device, max_sets: u32) -> Result<Self> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: max_sets * 8,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: max_sets * 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: max_sets,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&info, None).map_err(crate::Error::from)? };
        debug!("Created descriptor pool for {max_sets} sets");
        Ok(DescriptorBinder {
            device,
            pool,
        })
    }

    /// Create a set layout from a list of bindings. Each binding holds a
    /// single descriptor.
    pub fn create_layout(&self, bindings: &[LayoutBinding]) -> Result<Arc<SetLayout>> {
        let vk_bindings = bindings
            .iter()
            .map(|&(binding, ty, stages)| vk::DescriptorSetLayoutBinding {
                binding,
                descriptor_type: ty,
                descriptor_count: 1,
                stage_flags: stages,
                p_immutable_samplers: std::ptr::null(),
            })
            .collect::<Vec<_>>();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(vk_bindings.as_slice());
        let handle = unsafe {
            self.device
                .create_descriptor_set_layout(&info, None)
                .map_err(crate::Error::from)?
        };
        Ok(Arc::new(SetLayout {
            device: self.device.clone(),
            handle,
        }))
    }

    /// Allocate one descriptor set with the given layout. Sets live as long as
    /// the pool; they are never freed individually, only rewritten.
    pub fn allocate(&self, layout: &SetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [unsafe { layout.handle() }];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&info).map_err(crate::Error::from)? };
        Ok(sets[0])
    }
}

impl Drop for DescriptorBinder {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum WriteInfo {
    Image(usize),
    Buffer(usize),
}

/// Collects descriptor writes and submits them in one
/// `vkUpdateDescriptorSets` call.
///
/// Image and buffer infos are buffered separately so the final write structs
/// can point into stable storage.
#[derive(Default)]
pub struct DescriptorWriter {
    images: Vec<vk::DescriptorImageInfo>,
    buffers: Vec<vk::DescriptorBufferInfo>,
    writes: Vec<(vk::DescriptorSet, u32, vk::DescriptorType, WriteInfo)>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an image with its own sampler as a combined image sampler, to be
    /// read in shader-read layout.
    pub fn sample_image(mut self, set: vk::DescriptorSet, binding: u32, image: &Image) -> Self {
        self.images.push(vk::DescriptorImageInfo {
            sampler: image.sampler(),
            image_view: image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
        self.writes.push((
            set,
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            WriteInfo::Image(self.images.len() - 1),
        ));
        self
    }

    /// Bind a depth image as a combined image sampler in depth-read layout.
    pub fn sample_depth(mut self, set: vk::DescriptorSet, binding: u32, image: &Image) -> Self {
        self.images.push(vk::DescriptorImageInfo {
            sampler: image.sampler(),
            image_view: image.view(),
            image_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        });
        self.writes.push((
            set,
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            WriteInfo::Image(self.images.len() - 1),
        ));
        self
    }

    /// Bind a whole buffer as a uniform buffer.
    pub fn uniform_buffer(mut self, set: vk::DescriptorSet, binding: u32, buffer: &Buffer) -> Self {
        self.buffers.push(vk::DescriptorBufferInfo {
            buffer: unsafe { buffer.handle() },
            offset: 0,
            range: buffer.size(),
        });
        self.writes.push((
            set,
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
            WriteInfo::Buffer(self.buffers.len() - 1),
        ));
        self
    }

    /// Bind a whole buffer as a storage buffer.
    pub fn storage_buffer(mut self, set: vk::DescriptorSet, binding: u32, buffer: &Buffer) -> Self {
        self.buffers.push(vk::DescriptorBufferInfo {
            buffer: unsafe { buffer.handle() },
            offset: 0,
            range: buffer.size(),
        });
        self.writes.push((
            set,
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
            WriteInfo::Buffer(self.buffers.len() - 1),
        ));
        self
    }

    /// Flush all collected writes.
    pub fn update(self, device: &Device) {
        let writes = self
            .writes
            .iter()
            .map(|(set, binding, ty, info)| {
                let mut write = vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    p_next: std::ptr::null(),
                    dst_set: *set,
                    dst_binding: *binding,
                    dst_array_element: 0,
                    descriptor_count: 1,
                    descriptor_type: *ty,
                    p_image_info: std::ptr::null(),
                    p_buffer_info: std::ptr::null(),
                    p_texel_buffer_view: std::ptr::null(),
                };
                match info {
                    WriteInfo::Image(index) => write.p_image_info = &self.images[*index],
                    WriteInfo::Buffer(index) => write.p_buffer_info = &self.buffers[*index],
                }
                write
            })
            .collect::<Vec<_>>();
        unsafe {
            device.update_descriptor_sets(writes.as_slice(), &[]);
        }
    }
}
