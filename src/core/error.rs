//! Exposes the deimos error type.

use std::ffi::NulError;

use gpu_allocator::AllocationError;
use thiserror::Error;

/// Error type that deimos can return.
///
/// Setup errors abort initialization before the render loop starts. Runtime
/// errors (failed allocations on resize, device loss) propagate out of
/// [`Renderer::draw_frame`](crate::renderer::Renderer::draw_frame) and are not
/// retried; the engine assumes a correctly configured GPU environment and
/// treats violations as programmer or environment errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load the Vulkan library.
    #[error("Failed to load Vulkan.")]
    LoadFailed(ash::LoadingError),
    /// Generic Vulkan error type.
    #[error("Vulkan error: `{0}`")]
    VkError(ash::vk::Result),
    /// Could not convert rust string to C-String because it has null bytes.
    #[error("Invalid C string")]
    InvalidString(NulError),
    /// No suitable GPU found.
    #[error("No physical device found with graphics, compute and present support.")]
    NoGpu,
    /// The surface reported no supported formats.
    #[error("No supported surface formats found.")]
    NoSurfaceFormat,
    /// The surface or the chosen format is missing a capability the engine
    /// requires. There is no software fallback.
    #[error("Surface is missing a required capability: {0}")]
    UnsupportedSurface(&'static str),
    /// No queue was found that supports presentation.
    #[error("No queue found that supports presentation.")]
    NoPresentQueue,
    /// No queue was found that supports compute.
    #[error("No queue found that supports compute.")]
    NoComputeQueue,
    /// Vulkan memory allocation error.
    #[error("Vulkan allocation error: `{0}`")]
    AllocationError(AllocationError),
    /// The pass graph contains a cycle and is impossible to order.
    #[error("Pass graph contains a cycle.")]
    GraphHasCycle,
    /// A pass looked up a render target that was never put in the table.
    #[error("No render target bound under name `{0}`")]
    NoTargetBound(String),
    /// A pass requested SPIR-V byte code that the caller never supplied.
    #[error("Shader `{0}` not found in the shader set.")]
    NoShader(String),
    /// A mapped write would run past the end of the buffer allocation.
    #[error("Buffer write of {len} bytes at offset {offset} exceeds buffer size {size}.")]
    BufferWriteOutOfRange {
        offset: u64,
        len: u64,
        size: u64,
    },
    /// Mappable buffer expected.
    #[error("Requested mappable buffer, but buffer does not have a memory map")]
    UnmappableBuffer,
    /// Uncategorized error.
    #[error("Uncategorized error: `{0}`")]
    Uncategorized(&'static str),
}

impl From<ash::LoadingError> for Error {
    fn from(value: ash::LoadingError) -> Self {
        Error::LoadFailed(value)
    }
}

impl From<ash::vk::Result> for Error {
    fn from(value: ash::vk::Result) -> Self {
        Error::VkError(value)
    }
}

impl From<NulError> for Error {
    fn from(value: NulError) -> Self {
        Error::InvalidString(value)
    }
}

impl From<AllocationError> for Error {
    fn from(value: AllocationError) -> Self {
        Error::AllocationError(value)
    }
}
