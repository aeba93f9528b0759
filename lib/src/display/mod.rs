//! The DRM/KMS display device.
//!
//! Opening the device performs the one-time discovery pass: pick the first
//! connector that is wired to an active CRTC, remember that CRTC's mode as
//! the output window, and find a plane on it that can scan out planar
//! YUV420. Everything the steady-state presentation path needs afterwards
//! goes through the [`scanout::ScanoutOps`] trait implemented here.

pub mod scanout;

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use drm::buffer::{DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{
    connector, crtc, framebuffer, plane, property, Device as ControlDevice, FbCmd2Flags,
};
use drm::Device;
use log::{debug, info, warn};
use thiserror::Error;

use crate::Rect;
pub use scanout::DrmPreview;
use scanout::{FbGeometry, PropertyError, ScanoutOps};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to open DRM device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot become DRM master (is a compositor running?): {0}")]
    NotMaster(io::Error),
    #[error("failed to enumerate DRM resources: {0}")]
    Resources(io::Error),
    #[error("no connected connector with an active CRTC")]
    NoActiveConnector,
    #[error("no plane on the active CRTC supports YUV420")]
    NoPlane,
}

/// The opened DRM device node.
struct Card(std::fs::File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    fn open(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        options.write(true);
        Ok(Card(options.open(path)?))
    }
}

// The GEM handle produced by a PRIME import has no dedicated close entry
// point in the modesetting API ; it is released through the generic GEM
// close ioctl.
#[repr(C)]
#[allow(dead_code)]
struct DrmGemClose {
    handle: u32,
    pad: u32,
}

#[doc(hidden)]
mod ioctl {
    nix::ioctl_write_ptr!(drm_gem_close, b'd', 0x09, super::DrmGemClose);
}

/// A DRM device with its discovered connector, CRTC and YUV420-capable
/// plane, holding the master lock for the lifetime of the value.
pub struct DrmDisplay {
    card: Card,
    crtc: crtc::Handle,
    plane: plane::Handle,
    connector: connector::Handle,
    output: Rect,
    max_size: (u32, u32),
}

impl DrmDisplay {
    /// Opens `path` and runs the discovery pass.
    ///
    /// Fails if the device cannot be opened, master cannot be acquired, no
    /// connector is driving an active CRTC, or no plane on that CRTC
    /// advertises YUV420.
    pub fn open(path: &Path) -> Result<Self, DisplayError> {
        let card = Card::open(path).map_err(|source| DisplayError::Open {
            path: path.to_owned(),
            source,
        })?;

        // SetPlane is rejected without master; fail here rather than on
        // the first flip.
        card.acquire_master_lock().map_err(DisplayError::NotMaster)?;

        let resources = card.resource_handles().map_err(DisplayError::Resources)?;
        let max_size = (resources.width.1, resources.height.1);

        let mut chosen = None;
        for &connector_handle in resources.connectors() {
            let Ok(connector_info) = card.get_connector(connector_handle, false) else {
                continue;
            };
            let Some(encoder_handle) = connector_info.current_encoder() else {
                continue;
            };
            let Ok(encoder_info) = card.get_encoder(encoder_handle) else {
                continue;
            };
            let Some(crtc_handle) = encoder_info.crtc() else {
                continue;
            };
            let Ok(crtc_info) = card.get_crtc(crtc_handle) else {
                continue;
            };
            let Some(mode) = crtc_info.mode() else {
                continue;
            };

            let (width, height) = mode.size();
            info!(
                "connector {:?} ({:?}): {}x{} (chosen)",
                connector_handle,
                connector_info.interface(),
                width,
                height
            );
            chosen = Some((connector_handle, crtc_handle, mode));
            break;
        }
        let (connector, crtc, mode) = chosen.ok_or(DisplayError::NoActiveConnector)?;

        let planes = card.plane_handles().map_err(DisplayError::Resources)?;
        let mut chosen_plane = None;
        for &plane_handle in planes.iter() {
            let Ok(plane_info) = card.get_plane(plane_handle) else {
                continue;
            };
            if !resources
                .filter_crtcs(plane_info.possible_crtcs())
                .contains(&crtc)
            {
                continue;
            }
            if plane_info
                .formats()
                .iter()
                .any(|&format| format == DrmFourcc::Yuv420 as u32)
            {
                debug!("using plane {:?} for YUV420 scanout", plane_handle);
                chosen_plane = Some(plane_handle);
                break;
            }
        }
        let plane = chosen_plane.ok_or(DisplayError::NoPlane)?;

        let (width, height) = mode.size();
        Ok(DrmDisplay {
            card,
            crtc,
            plane,
            connector,
            output: Rect::from_size(u32::from(width), u32::from(height)),
            max_size,
        })
    }

    /// The connector the output is going to.
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// The full output window (the CRTC's active mode, at the origin).
    pub fn output_rect(&self) -> Rect {
        self.output
    }

    /// The largest framebuffer the device accepts.
    pub fn max_fb_size(&self) -> (u32, u32) {
        self.max_size
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        if let Err(e) = self.card.release_master_lock() {
            warn!("failed to release DRM master: {}", e);
        }
    }
}

/// YUV420 plane layout over a single imported buffer object, as AddFB2
/// wants it.
struct Yuv420Framebuffer {
    bo: drm::buffer::Handle,
    geometry: FbGeometry,
}

impl PlanarBuffer for Yuv420Framebuffer {
    fn size(&self) -> (u32, u32) {
        (self.geometry.width, self.geometry.height)
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Yuv420
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        let [luma, cb, cr] = self.geometry.pitches;
        [luma, cb, cr, 0]
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        [Some(self.bo), Some(self.bo), Some(self.bo), None]
    }

    fn offsets(&self) -> [u32; 4] {
        let [luma, cb, cr] = self.geometry.offsets;
        [luma, cb, cr, 0]
    }
}

impl ScanoutOps for DrmDisplay {
    type BufferHandle = drm::buffer::Handle;
    type FbHandle = framebuffer::Handle;

    fn import_dmabuf(&self, fd: RawFd) -> io::Result<Self::BufferHandle> {
        // Safe because the fd is owned by a capture buffer that outlives
        // the import.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.card.prime_fd_to_buffer(fd)
    }

    fn add_framebuffer(
        &self,
        bo: Self::BufferHandle,
        geometry: &FbGeometry,
    ) -> io::Result<Self::FbHandle> {
        self.card.add_planar_framebuffer(
            &Yuv420Framebuffer {
                bo,
                geometry: *geometry,
            },
            FbCmd2Flags::empty(),
        )
    }

    fn remove_framebuffer(&self, fb: Self::FbHandle) -> io::Result<()> {
        self.card.destroy_framebuffer(fb)
    }

    fn close_buffer(&self, bo: Self::BufferHandle) -> io::Result<()> {
        let request = DrmGemClose {
            handle: std::num::NonZeroU32::from(bo).get(),
            pad: 0,
        };
        unsafe { ioctl::drm_gem_close(self.card.as_fd().as_raw_fd(), &request) }
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn set_plane(
        &self,
        fb: Self::FbHandle,
        dst: Rect,
        src_width: u32,
        src_height: u32,
    ) -> io::Result<()> {
        self.card.set_plane(
            self.plane,
            self.crtc,
            Some(fb),
            0,
            (dst.x, dst.y, dst.width, dst.height),
            // Source rectangle is in 16.16 fixed point.
            (0, 0, src_width << 16, src_height << 16),
        )
    }

    fn set_enum_property(&self, name: &str, value: &str) -> Result<(), PropertyError> {
        let properties = self
            .card
            .get_properties(self.plane)
            .map_err(PropertyError::Enumerate)?;
        let (ids, _values) = properties.as_props_and_values();

        for &id in ids {
            let Ok(property_info) = self.card.get_property(id) else {
                continue;
            };
            let property_name = property_info.name().to_string_lossy().into_owned();
            if !property_name.contains(name) {
                continue;
            }
            let property::ValueType::Enum(enum_values) = property_info.value_type() else {
                continue;
            };

            // Right property; now search its enum table for the value name.
            let (raw_values, names) = enum_values.values();
            for (&raw, enum_name) in raw_values.iter().zip(names) {
                if enum_name.name().to_string_lossy().contains(value) {
                    return self
                        .card
                        .set_property(self.plane, id, raw)
                        .map_err(|e| PropertyError::Set(property_name.clone(), e));
                }
            }
            return Err(PropertyError::ValueNotFound(
                property_name,
                value.to_owned(),
            ));
        }

        Err(PropertyError::NotFound(name.to_owned()))
    }
}

impl DrmPreview<DrmDisplay> {
    /// Opens the display device at `path` and wraps it as a preview going
    /// fullscreen on the discovered output.
    pub fn open(path: &Path) -> Result<Self, DisplayError> {
        let display = DrmDisplay::open(path)?;
        let output = display.output_rect();
        let max_size = display.max_fb_size();
        Ok(DrmPreview::new(display, output, max_size))
    }
}
