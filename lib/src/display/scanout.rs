//! Import of capture buffers into the display engine and plane flipping.
//!
//! Buffers reach this module as dmabuf fds. Each distinct fd is imported
//! and registered as a KMS framebuffer exactly once for the life of the
//! process (or until [`DrmPreview::reset`]); the cache below is keyed by fd
//! and consulted on every show.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use log::warn;
use thiserror::Error;

use crate::preview::{DoneCallback, Preview};
use crate::stream::{ColourSpace, StreamInfo};
use crate::Rect;

/// Kernel operations the presentation path needs from the display device.
///
/// One implementation talks to the DRM ioctl surface
/// ([`crate::display::DrmDisplay`]); tests substitute a fake that counts
/// calls.
pub trait ScanoutOps {
    /// GEM handle of an imported buffer object.
    type BufferHandle: Copy + Debug;
    /// Registered framebuffer handle.
    type FbHandle: Copy + Debug;

    /// Imports a dmabuf fd as a buffer object.
    fn import_dmabuf(&self, fd: RawFd) -> io::Result<Self::BufferHandle>;

    /// Registers `bo` with the given plane layout as a framebuffer the
    /// scanout engine can read.
    fn add_framebuffer(
        &self,
        bo: Self::BufferHandle,
        geometry: &FbGeometry,
    ) -> io::Result<Self::FbHandle>;

    fn remove_framebuffer(&self, fb: Self::FbHandle) -> io::Result<()>;

    fn close_buffer(&self, bo: Self::BufferHandle) -> io::Result<()>;

    /// Points the plane at `fb` on the next refresh, scanning out the full
    /// `src_width`×`src_height` source into `dst`.
    fn set_plane(
        &self,
        fb: Self::FbHandle,
        dst: Rect,
        src_width: u32,
        src_height: u32,
    ) -> io::Result<()>;

    /// Writes the enumerated plane property whose name contains `name` to
    /// the enum member whose name contains `value`.
    fn set_enum_property(&self, name: &str, value: &str) -> Result<(), PropertyError>;
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("property enumeration failed: {0}")]
    Enumerate(io::Error),
    #[error("no enum property matching \"{0}\" on the plane")]
    NotFound(String),
    #[error("no value matching \"{1}\" for property \"{0}\"")]
    ValueNotFound(String, String),
    #[error("failed to set property \"{0}\": {1}")]
    Set(String, io::Error),
}

#[derive(Debug, Error)]
pub enum ShowError {
    #[error("buffer import failed for fd {fd}: {source}")]
    Import { fd: RawFd, source: io::Error },
    #[error("framebuffer registration failed: {0}")]
    AddFramebuffer(io::Error),
    #[error("plane update failed: {0}")]
    SetPlane(io::Error),
}

/// Three-plane layout of a buffer as the framebuffer registration wants it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FbGeometry {
    pub width: u32,
    pub height: u32,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
}

impl FbGeometry {
    /// Layout of a planar YUV 4:2:0 buffer: full-resolution luma followed
    /// by two half-resolution chroma planes, all sharing one allocation.
    pub fn yuv420(info: &StreamInfo) -> Self {
        let luma_size = info.stride * info.height;
        FbGeometry {
            width: info.width,
            height: info.height,
            pitches: [info.stride, info.stride / 2, info.stride / 2],
            offsets: [
                0,
                luma_size,
                luma_size + (info.stride / 2) * (info.height / 2),
            ],
        }
    }
}

/// Largest rectangle of the source's aspect ratio that fits in `out`,
/// centered (letterboxed or pillarboxed against the fixed output window).
pub(crate) fn fit_rect(out: Rect, src_width: u32, src_height: u32) -> Rect {
    if u64::from(src_width) * u64::from(out.height)
        > u64::from(out.width) * u64::from(src_height)
    {
        // Source is wider than the window: full width, reduced height.
        let height =
            (u64::from(out.width) * u64::from(src_height) / u64::from(src_width)) as u32;
        Rect {
            x: out.x,
            y: out.y + ((out.height - height) / 2) as i32,
            width: out.width,
            height,
        }
    } else {
        let width =
            (u64::from(out.height) * u64::from(src_width) / u64::from(src_height)) as u32;
        Rect {
            x: out.x + ((out.width - width) / 2) as i32,
            y: out.y,
            width,
            height: out.height,
        }
    }
}

// KMS has no userspace definitions of the colour enums; the plane
// properties carry enum-name-to-value tables instead, so targets are
// expressed as name substrings.
const PROP_COLOR_ENCODING: &str = "COLOR_ENCODING";
const PROP_COLOR_RANGE: &str = "COLOR_RANGE";

/// Maps a stream colour space to the (encoding, range) property values the
/// plane should be programmed with.
fn colour_space_targets(colour_space: ColourSpace) -> (&'static str, &'static str) {
    match colour_space {
        ColourSpace::Jpeg => ("601", "full"),
        ColourSpace::Smpte170m => ("601", "limited"),
        ColourSpace::Rec709 => ("709", "limited"),
        other => {
            warn!(
                "unexpected colour space {:?}, defaulting to limited BT.601",
                other
            );
            ("601", "limited")
        }
    }
}

/// A capture buffer as registered with the display engine.
struct ScanoutBuffer<O: ScanoutOps> {
    bo: O::BufferHandle,
    fb: O::FbHandle,
}

/// Presents capture buffers on a scanout plane.
///
/// Keeps the fd-keyed cache of imported buffers, tracks which buffer the
/// plane is reading from, and reports the previous buffer through the done
/// callback once a different one has been flipped in.
pub struct DrmPreview<O: ScanoutOps> {
    ops: O,
    output: Rect,
    max_size: (u32, u32),
    // Looked up by capture completions and torn down by reset, which in
    // general run concurrently.
    buffers: Mutex<HashMap<RawFd, ScanoutBuffer<O>>>,
    last_fd: Option<RawFd>,
    negotiated: bool,
    done_callback: Option<DoneCallback>,
}

impl<O: ScanoutOps> DrmPreview<O> {
    pub fn new(ops: O, output: Rect, max_size: (u32, u32)) -> Self {
        Self {
            ops,
            output,
            max_size,
            buffers: Mutex::new(HashMap::new()),
            last_fd: None,
            negotiated: false,
            done_callback: None,
        }
    }

    /// The output window buffers are fitted into.
    pub fn output_rect(&self) -> Rect {
        self.output
    }

    /// Returns the framebuffer handle for `fd`, importing and registering
    /// the buffer if this is the first time the fd is seen.
    fn obtain(&mut self, fd: RawFd, info: &StreamInfo) -> Result<O::FbHandle, ShowError> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(buffer) = buffers.get(&fd) {
            return Ok(buffer.fb);
        }

        // The plane's colour interpretation must be fixed before any
        // buffer is shown. A missing property is not fatal: the plane
        // keeps its default behaviour and only presentation quality
        // suffers.
        if !self.negotiated {
            self.negotiated = true;
            let (encoding, range) = colour_space_targets(info.colour_space);
            for (name, value) in [
                (PROP_COLOR_ENCODING, encoding),
                (PROP_COLOR_RANGE, range),
            ] {
                if let Err(e) = self.ops.set_enum_property(name, value) {
                    warn!("colour negotiation: {}", e);
                }
            }
        }

        let bo = self
            .ops
            .import_dmabuf(fd)
            .map_err(|source| ShowError::Import { fd, source })?;
        let fb = self
            .ops
            .add_framebuffer(bo, &FbGeometry::yuv420(info))
            .map_err(ShowError::AddFramebuffer)?;
        buffers.insert(fd, ScanoutBuffer { bo, fb });

        Ok(fb)
    }
}

impl<O: ScanoutOps> Preview for DrmPreview<O> {
    fn set_done_callback(&mut self, callback: DoneCallback) {
        self.done_callback = Some(callback);
    }

    fn show(&mut self, fd: RawFd, _len: usize, info: &StreamInfo) -> Result<(), ShowError> {
        let fb = self.obtain(fd, info)?;

        let dst = fit_rect(self.output, info.width, info.height);
        self.ops
            .set_plane(fb, dst, info.width, info.height)
            .map_err(ShowError::SetPlane)?;

        // The buffer shown before this call is now off the plane; hand it
        // back. The newly shown fd is never reported, and re-showing the
        // active fd retires nothing.
        if let Some(previous) = self.last_fd {
            if previous != fd {
                match self.done_callback.as_mut() {
                    Some(callback) => callback(previous),
                    None => warn!("no done callback, buffer fd {} will not recycle", previous),
                }
            }
        }
        self.last_fd = Some(fd);

        Ok(())
    }

    fn reset(&mut self) {
        let mut buffers = self.buffers.lock().unwrap();
        for (fd, buffer) in buffers.drain() {
            if let Err(e) = self.ops.remove_framebuffer(buffer.fb) {
                warn!("removing framebuffer of fd {}: {}", fd, e);
            }
            // Closing the imported handle can only really fail if the
            // handle is already gone ; complain and carry on.
            if let Err(e) = self.ops.close_buffer(buffer.bo) {
                warn!("closing buffer object of fd {}: {}", fd, e);
            }
        }
        self.last_fd = None;
        self.negotiated = false;
    }

    fn max_image_size(&self) -> (u32, u32) {
        self.max_size
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::stream::PIXEL_FORMAT_YUV420;

    /// Counts every kernel call the preview makes.
    #[derive(Default)]
    struct FakeOps {
        imports: RefCell<Vec<RawFd>>,
        added: Cell<u32>,
        removed: RefCell<Vec<u32>>,
        closed: RefCell<Vec<u32>>,
        flips: RefCell<Vec<(u32, Rect)>>,
        properties: RefCell<Vec<(String, String)>>,
    }

    impl ScanoutOps for FakeOps {
        type BufferHandle = u32;
        type FbHandle = u32;

        fn import_dmabuf(&self, fd: RawFd) -> io::Result<u32> {
            self.imports.borrow_mut().push(fd);
            Ok(fd as u32 + 100)
        }

        fn add_framebuffer(&self, bo: u32, _geometry: &FbGeometry) -> io::Result<u32> {
            self.added.set(self.added.get() + 1);
            Ok(bo + 100)
        }

        fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
            self.removed.borrow_mut().push(fb);
            Ok(())
        }

        fn close_buffer(&self, bo: u32) -> io::Result<()> {
            self.closed.borrow_mut().push(bo);
            Ok(())
        }

        fn set_plane(
            &self,
            fb: u32,
            dst: Rect,
            _src_width: u32,
            _src_height: u32,
        ) -> io::Result<()> {
            self.flips.borrow_mut().push((fb, dst));
            Ok(())
        }

        fn set_enum_property(&self, name: &str, value: &str) -> Result<(), PropertyError> {
            self.properties
                .borrow_mut()
                .push((name.to_owned(), value.to_owned()));
            Ok(())
        }
    }

    fn test_info() -> StreamInfo {
        StreamInfo {
            width: 640,
            height: 480,
            stride: 640,
            pixel_format: PIXEL_FORMAT_YUV420,
            colour_space: ColourSpace::Rec709,
        }
    }

    fn test_preview() -> DrmPreview<FakeOps> {
        DrmPreview::new(
            FakeOps::default(),
            Rect::from_size(1280, 720),
            (4096, 4096),
        )
    }

    fn collecting_callback() -> (DoneCallback, Arc<Mutex<Vec<RawFd>>>) {
        let dones = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dones);
        let callback: DoneCallback = Box::new(move |fd| sink.lock().unwrap().push(fd));
        (callback, dones)
    }

    #[test]
    fn test_import_is_idempotent() {
        let mut preview = test_preview();
        let (callback, _dones) = collecting_callback();
        preview.set_done_callback(callback);

        let info = test_info();
        preview.show(5, 460800, &info).unwrap();
        preview.show(5, 460800, &info).unwrap();

        // One import/registration sequence, two flips.
        assert_eq!(*preview.ops.imports.borrow(), vec![5]);
        assert_eq!(preview.ops.added.get(), 1);
        assert_eq!(preview.ops.flips.borrow().len(), 2);
    }

    #[test]
    fn test_colour_negotiation_happens_once_before_first_show() {
        let mut preview = test_preview();
        let (callback, _dones) = collecting_callback();
        preview.set_done_callback(callback);

        let info = test_info();
        preview.show(5, 460800, &info).unwrap();
        preview.show(6, 460800, &info).unwrap();

        let properties = preview.ops.properties.borrow();
        assert_eq!(
            *properties,
            vec![
                ("COLOR_ENCODING".to_owned(), "709".to_owned()),
                ("COLOR_RANGE".to_owned(), "limited".to_owned()),
            ]
        );
    }

    #[test]
    fn test_done_sequence_trails_show_sequence() {
        let mut preview = test_preview();
        let (callback, dones) = collecting_callback();
        preview.set_done_callback(callback);

        let info = test_info();
        for fd in 1..=5 {
            preview.show(fd, 460800, &info).unwrap();
        }

        // b1..b4 retired in order; b5 still on the plane.
        assert_eq!(*dones.lock().unwrap(), vec![1, 2, 3, 4]);

        preview.show(6, 460800, &info).unwrap();
        assert_eq!(*dones.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_reshowing_active_buffer_retires_nothing() {
        let mut preview = test_preview();
        let (callback, dones) = collecting_callback();
        preview.set_done_callback(callback);

        let info = test_info();
        preview.show(7, 460800, &info).unwrap();
        preview.show(7, 460800, &info).unwrap();

        assert!(dones.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reset_releases_and_forgets() {
        let mut preview = test_preview();
        let (callback, _dones) = collecting_callback();
        preview.set_done_callback(callback);

        let info = test_info();
        preview.show(5, 460800, &info).unwrap();
        preview.reset();

        assert_eq!(*preview.ops.removed.borrow(), vec![205]);
        assert_eq!(*preview.ops.closed.borrow(), vec![105]);

        // A previously seen fd must be imported afresh, and the colour
        // negotiation runs again.
        preview.show(5, 460800, &info).unwrap();
        assert_eq!(*preview.ops.imports.borrow(), vec![5, 5]);
        assert_eq!(preview.ops.properties.borrow().len(), 4);
    }

    #[test]
    fn test_fit_rect_pillarboxes_narrow_source() {
        let out = Rect::from_size(1280, 720);
        assert_eq!(fit_rect(out, 640, 480), Rect::new(160, 0, 960, 720));
    }

    #[test]
    fn test_fit_rect_letterboxes_wide_source() {
        let out = Rect::from_size(1280, 720);
        assert_eq!(fit_rect(out, 2000, 500), Rect::new(0, 200, 1280, 320));
    }

    #[test]
    fn test_fit_rect_exact_aspect_fills_output() {
        let out = Rect::from_size(1280, 720);
        assert_eq!(fit_rect(out, 1920, 1080), Rect::from_size(1280, 720));
    }

    #[test]
    fn test_colour_space_table() {
        assert_eq!(colour_space_targets(ColourSpace::Jpeg), ("601", "full"));
        assert_eq!(
            colour_space_targets(ColourSpace::Smpte170m),
            ("601", "limited")
        );
        assert_eq!(colour_space_targets(ColourSpace::Rec709), ("709", "limited"));
        // Anything else falls back to the limited BT.601 default.
        assert_eq!(colour_space_targets(ColourSpace::Rec2020), ("601", "limited"));
        assert_eq!(colour_space_targets(ColourSpace::Raw), ("601", "limited"));
    }

    #[test]
    fn test_yuv420_geometry() {
        let geometry = FbGeometry::yuv420(&StreamInfo {
            width: 1280,
            height: 720,
            stride: 1280,
            pixel_format: PIXEL_FORMAT_YUV420,
            colour_space: ColourSpace::Rec709,
        });
        assert_eq!(geometry.pitches, [1280, 640, 640]);
        assert_eq!(geometry.offsets, [0, 921600, 1152000]);
    }

    #[test]
    fn test_show_after_failed_import_leaves_no_cache_entry() {
        struct FailingOps(FakeOps);

        impl ScanoutOps for FailingOps {
            type BufferHandle = u32;
            type FbHandle = u32;

            fn import_dmabuf(&self, _fd: RawFd) -> io::Result<u32> {
                Err(io::Error::from_raw_os_error(nix::libc::ENODEV))
            }

            fn add_framebuffer(&self, bo: u32, geometry: &FbGeometry) -> io::Result<u32> {
                self.0.add_framebuffer(bo, geometry)
            }

            fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
                self.0.remove_framebuffer(fb)
            }

            fn close_buffer(&self, bo: u32) -> io::Result<()> {
                self.0.close_buffer(bo)
            }

            fn set_plane(&self, fb: u32, dst: Rect, w: u32, h: u32) -> io::Result<()> {
                self.0.set_plane(fb, dst, w, h)
            }

            fn set_enum_property(&self, name: &str, value: &str) -> Result<(), PropertyError> {
                self.0.set_enum_property(name, value)
            }
        }

        let mut preview = DrmPreview::new(
            FailingOps(FakeOps::default()),
            Rect::from_size(1280, 720),
            (4096, 4096),
        );
        let info = test_info();
        assert!(matches!(
            preview.show(5, 460800, &info),
            Err(ShowError::Import { fd: 5, .. })
        ));
        assert!(preview.buffers.lock().unwrap().is_empty());
        assert!(preview.last_fd.is_none());
    }
}
