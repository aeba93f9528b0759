//! Read-only geometry of the active capture stream.

use libcamera::pixel_format::PixelFormat;

/// The YUV 4:2:0 planar format used on both sides of the pipeline
/// (libcamera `YUV420` and DRM `YUV420` share the `YU12` fourcc).
pub const PIXEL_FORMAT_YUV420: PixelFormat =
    PixelFormat::new(u32::from_le_bytes(*b"YU12"), 0);

/// Colour space the stream was configured with.
///
/// The display plane needs to know how to interpret the YUV samples; the
/// capture side records here what it asked the camera for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColourSpace {
    /// Full-range sRGB-like YCbCr (the JPEG colour space).
    Jpeg,
    /// Limited-range BT.601.
    Smpte170m,
    /// Limited-range BT.709.
    Rec709,
    /// Limited-range BT.2020.
    Rec2020,
    /// Unprocessed sensor data.
    Raw,
}

/// Geometry of the single active stream, computed once after the stream
/// configuration has been validated and applied, and immutable afterwards.
///
/// `stride` is the number of bytes per luma row and may exceed
/// `width * bytes_per_pixel` due to hardware alignment; every consumer of
/// the buffer contents must use it rather than deriving a pitch from the
/// width.
#[derive(Clone, Copy, Debug)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixel_format: PixelFormat,
    pub colour_space: ColourSpace,
}
