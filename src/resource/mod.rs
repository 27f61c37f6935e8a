//! GPU resource primitives: images, buffers, render passes, framebuffers and
//! pipelines.
//!
//! All primitives own their Vulkan handles and back them with `Drop` impls.
//! Destruction order between dependent objects (a framebuffer and the render
//! pass it was built for, a pipeline and its descriptor set layouts) is the
//! responsibility of the owning pass module, which drops dependents first.

pub mod buffer;
pub mod image;
pub mod pipeline;
pub mod render_pass;
