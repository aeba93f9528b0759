//! Capability interface of a preview sink.

use std::os::unix::io::RawFd;

use crate::display::scanout::ShowError;
use crate::stream::StreamInfo;

/// Invoked with a buffer identity once the sink is no longer displaying
/// that buffer and it can safely be recycled for capture.
pub type DoneCallback = Box<dyn FnMut(RawFd) + Send>;

/// A sink that can present capture buffers by their dmabuf fd.
///
/// The hardware-backed implementation is [`crate::display::DrmPreview`];
/// tests drive the hand-off protocol through a fake.
pub trait Preview {
    /// Sets the callback reporting buffers the sink has retired.
    ///
    /// Must be installed before the first [`Preview::show`]; a retirement
    /// with no callback installed would leak the buffer out of the capture
    /// rotation.
    fn set_done_callback(&mut self, callback: DoneCallback);

    /// Displays the buffer backed by `fd`, whose mapped contents are
    /// `len` bytes laid out as described by `info`.
    ///
    /// The same fd will be handed back through the done callback once a
    /// different buffer has replaced it on the display.
    fn show(&mut self, fd: RawFd, len: usize, info: &StreamInfo) -> Result<(), ShowError>;

    /// Releases every buffer known to the sink and forgets the active
    /// buffer, so a subsequent `show` behaves as if freshly started.
    fn reset(&mut self);

    /// The largest image size the sink can display.
    fn max_image_size(&self) -> (u32, u32);
}
