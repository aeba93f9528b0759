//! Zero-copy preview pipeline from a libcamera capture stream to a DRM/KMS
//! scanout plane.
//!
//! The crate is organized around the buffer hand-off protocol between two
//! independently asynchronous subsystems:
//!
//! * The `capture` module owns the camera: stream configuration, kernel
//!   buffer allocation, and the request pool that cycles each buffer
//!   through queue → complete → reuse without ever reallocating.
//! * The `mapping` module maps every capture buffer into process memory
//!   exactly once, coalescing planes that share a dmabuf fd.
//! * The `display` module imports completed buffers into KMS by their
//!   dmabuf fd, registers them as framebuffers once, and flips them onto a
//!   plane; the previously shown buffer is reported back through a done
//!   callback when the hardware has moved off it.
//! * The `pipeline` module is the glue: it maps buffer identities to
//!   in-flight requests so a done callback can be resolved back to the
//!   request that produced the frame, and recycles it to the camera.
//!
//! No pixel data is copied anywhere on this path; buffers are shared by fd
//! between the camera and the display engine.

pub mod capture;
pub mod display;
pub mod legacy;
pub mod mapping;
pub mod pipeline;
pub mod preview;
pub mod stream;

/// A pixel rectangle on the output, offset from the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle of the given size at the origin.
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}
