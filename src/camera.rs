//! The camera state consumed by pass uniforms.
//!
//! The engine does not own a camera controller; the caller computes these
//! matrices each frame and hands them in before
//! [`Renderer::draw_frame`](crate::renderer::Renderer::draw_frame). The
//! previous-frame view matrix is what TAA and motion blur reproject with.

use glam::{Mat4, Vec2};

/// Camera matrices for the current frame.
#[derive(Debug, Default, Copy, Clone)]
pub struct CameraState {
    pub view: Mat4,
    pub projection: Mat4,
    /// View matrix of the previous frame, for reprojection.
    pub previous_view: Mat4,
    pub inv_projection: Mat4,
    pub inv_view_projection: Mat4,
    /// Sub-pixel jitter applied to the projection this frame.
    pub jitter: Vec2,
}

impl CameraState {
    /// Fill the derived matrices from `view` and `projection`.
    pub fn with_derived(view: Mat4, projection: Mat4, previous_view: Mat4) -> Self {
        CameraState {
            view,
            projection,
            previous_view,
            inv_projection: projection.inverse(),
            inv_view_projection: (projection * view).inverse(),
            jitter: Vec2::ZERO,
        }
    }
}
