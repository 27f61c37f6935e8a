//! The narrow interface the engine needs from a windowing library.

use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

/// Implemented by window types the engine can present to. Any windowing
/// library can be supported by implementing this on its window type; an
/// implementation for `winit` ships behind the `winit` feature.
pub trait WindowInterface: HasRawWindowHandle + HasRawDisplayHandle {
    /// Current drawable width in pixels.
    fn width(&self) -> u32;
    /// Current drawable height in pixels.
    fn height(&self) -> u32;
}

#[cfg(feature = "winit")]
impl WindowInterface for winit::window::Window {
    fn width(&self) -> u32 {
        self.inner_size().width
    }

    fn height(&self) -> u32 {
        self.inner_size().height
    }
}
