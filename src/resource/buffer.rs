//! Wrappers for `VkBuffer` objects.
//!
//! Writable buffers follow a scoped-acquisition pattern: [`Buffer::map`]
//! returns a [`MappedBuffer`] guard through which bytes are copied and flushed;
//! dropping the guard is the unmap step and happens on every exit path,
//! including early returns through `?`.

use std::ptr::NonNull;

use anyhow::Result;
use ash::vk;

use crate::allocator::{Allocation, Allocator, MemoryLocation};
use crate::core::device::Device;
use crate::core::error::Error;
use crate::core::DeviceContext;
use crate::util::align_down;

/// Wrapper around a [`VkBuffer`](vk::Buffer) and its memory allocation.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Buffer {
    #[derivative(Debug = "ignore")]
    device: Device,
    #[derivative(Debug = "ignore")]
    allocator: Allocator,
    #[derivative(Debug = "ignore")]
    memory: Option<Allocation>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Allocate a new buffer.
    ///
    /// The final size is the GPU's reported memory requirement for the buffer,
    /// which can exceed the requested `size`; [`Buffer::size`] reports the
    /// allocated size. No memory type satisfying `location` is a fatal error
    /// from the allocator.
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let device = ctx.device.clone();
        let handle = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size)
                    .usage(usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            ).map_err(Error::from)?
        };
        #[cfg(feature = "log-objects")]
        trace!("Created new VkBuffer {:?} (size = {} bytes)", handle, size);

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let memory = ctx.allocator.allocate("buffer", &requirements, location, true)?;
        unsafe {
            device
                .bind_buffer_memory(handle, memory.memory(), memory.offset())
                .map_err(Error::from)?
        };

        Ok(Self {
            device,
            allocator: ctx.allocator.clone(),
            size: requirements.size.max(size),
            memory: Some(memory),
            handle,
        })
    }

    /// Allocate a host-visible uniform buffer.
    pub fn new_uniform(ctx: &DeviceContext, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Allocate a host-visible storage buffer.
    pub fn new_storage(ctx: &DeviceContext, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Acquire write access to the buffer's memory.
    /// # Errors
    /// Fails with [`Error::UnmappableBuffer`] if the buffer was not allocated
    /// from a host-visible heap.
    pub fn map(&self) -> Result<MappedBuffer<'_>> {
        let memory = self.memory.as_ref().expect("buffer memory already freed");
        let pointer = memory.mapped_ptr().ok_or(Error::UnmappableBuffer)?;
        Ok(MappedBuffer {
            device: &self.device,
            memory: unsafe { memory.memory() },
            memory_offset: memory.offset(),
            pointer,
            size: self.size,
        })
    }

    /// Obtain a handle to the raw vulkan buffer object.
    /// # Safety
    /// * The caller must not use this handle after `self` is dropped.
    /// * The caller must not call `vkDestroyBuffer` on this handle.
    pub unsafe fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Get the allocated size of this buffer.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        #[cfg(feature = "log-objects")]
        trace!("Destroying VkBuffer {:?}", self.handle);
        unsafe {
            self.device.destroy_buffer(self.handle, None);
        }
        if let Some(memory) = self.memory.take() {
            if let Err(err) = self.allocator.free(memory) {
                error!("Failed to free buffer memory: {err}");
            }
        }
    }
}

/// Scoped write access to a mapped buffer. Dropping the guard releases the
/// mapping scope; while it lives, the backing memory is pinned.
#[derive(Debug)]
pub struct MappedBuffer<'a> {
    device: &'a Device,
    memory: vk::DeviceMemory,
    memory_offset: vk::DeviceSize,
    pointer: NonNull<std::ffi::c_void>,
    size: vk::DeviceSize,
}

impl MappedBuffer<'_> {
    /// Copy `bytes` into the buffer at `offset`.
    /// # Errors
    /// Fails with [`Error::BufferWriteOutOfRange`] if the write would run past
    /// the end of the allocation. Nothing is written in that case.
    pub fn copy_data(&mut self, bytes: &[u8], offset: vk::DeviceSize) -> Result<()> {
        let len = bytes.len() as vk::DeviceSize;
        if offset + len > self.size {
            return Err(Error::BufferWriteOutOfRange {
                offset,
                len,
                size: self.size,
            }
            .into());
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.pointer.as_ptr().cast::<u8>().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Zero the entire buffer.
    pub fn zero(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.pointer.as_ptr().cast::<u8>(), 0, self.size as usize);
        }
    }

    /// Make CPU writes visible to the GPU. Required before submitting work
    /// that reads the buffer when the memory is not host-coherent; harmless
    /// otherwise.
    pub fn flush(&self) -> Result<()> {
        let atom = self.device.properties().limits.non_coherent_atom_size;
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(align_down(self.memory_offset, atom))
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device
                .flush_mapped_memory_ranges(std::slice::from_ref(&range))
                .map_err(Error::from)?
        };
        Ok(())
    }
}
