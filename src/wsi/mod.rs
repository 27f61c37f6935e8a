//! Window system integration: the presentation surface and the swapchain.
//!
//! Windowing and event polling are external collaborators; the engine only
//! needs raw handles and a size, expressed by the
//! [`WindowInterface`](crate::wsi::window::WindowInterface) trait.

pub mod surface;
pub mod swapchain;
pub mod window;
