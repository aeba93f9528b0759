//! Detection of the legacy Raspberry Pi camera stack.
//!
//! Images configured for the out-of-tree `bm2835 mmal` V4L2 driver hide the
//! sensor from libcamera; detect that early and refuse to run instead of
//! failing obscurely at stream configuration.

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::AsRawFd;

const LEGACY_DRIVER: &str = "bm2835 mmal";
const VIDEO_DEVICE: &str = "/dev/video0";

/// Local definition of the `VIDIOC_QUERYCAP` result; only the driver name
/// is of interest here.
#[repr(C)]
#[allow(non_camel_case_types, dead_code)]
struct v4l2_capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[doc(hidden)]
mod ioctl {
    nix::ioctl_read!(vidioc_querycap, b'V', 0, super::v4l2_capability);
}

fn string_from_cstr(bytes: &[u8]) -> String {
    CStr::from_bytes_until_nul(bytes)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Returns whether `/dev/video0` is driven by the legacy camera stack.
///
/// A missing or unreadable device node means the legacy stack is not in
/// the way.
pub fn legacy_stack_present() -> bool {
    let Ok(device) = OpenOptions::new().read(true).write(true).open(VIDEO_DEVICE) else {
        return false;
    };

    let mut capability: v4l2_capability = unsafe { mem::zeroed() };
    if unsafe { ioctl::vidioc_querycap(device.as_raw_fd(), &mut capability) }.is_err() {
        return false;
    }

    string_from_cstr(&capability.driver) == LEGACY_DRIVER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_name_extraction() {
        let mut driver = [0u8; 16];
        driver[..11].copy_from_slice(b"bm2835 mmal");
        assert_eq!(string_from_cstr(&driver), LEGACY_DRIVER);

        let unterminated = [b'x'; 16];
        assert_eq!(string_from_cstr(&unterminated), "");
    }
}
