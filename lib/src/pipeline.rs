//! Hand-off of completed capture buffers to the display, and of retired
//! display buffers back to capture.
//!
//! Two asynchronous sources meet here: capture completions arriving from
//! the camera's dispatch thread and buffer retirements reported by the
//! display. Neither side calls into the other directly; completions cross
//! over a channel owned by the driver loop, and retirements are enqueued by
//! the done callback and drained after each show. The table mapping buffer
//! identities to in-flight requests is the single piece of state both sides
//! touch, and is mutex-serialized.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Mutex;

use libcamera::request::Request;
use log::warn;
use thiserror::Error;

use crate::capture::{CaptureError, CaptureSession};
use crate::display::scanout::ShowError;
use crate::preview::Preview;
use crate::stream::StreamInfo;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Show(#[from] ShowError),
}

/// Requests whose buffers are on (or headed to) the display, keyed by
/// buffer identity.
///
/// A request parked here must not be resubmitted to the camera until the
/// display retires its buffer; taking it out again is the only way to
/// recycle it.
pub struct InflightTable<R> {
    entries: Mutex<HashMap<RawFd, R>>,
}

impl<R> Default for InflightTable<R> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<R> InflightTable<R> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Parks `request` under `fd`.
    ///
    /// Two live requests may never share one buffer; an occupied slot
    /// means the protocol was violated upstream, and the older request is
    /// dropped rather than resubmitted twice.
    pub fn record(&self, fd: RawFd, request: R) {
        if self.entries.lock().unwrap().insert(fd, request).is_some() {
            warn!("buffer fd {} was already in flight, dropping older request", fd);
        }
    }

    /// Takes the request parked under `fd`, if any.
    pub fn take(&self, fd: RawFd) -> Option<R> {
        self.entries.lock().unwrap().remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Coordinates the show/done cycle between a capture session and a preview
/// sink.
pub struct HandoffPipeline<P: Preview, R = Request> {
    preview: P,
    inflight: InflightTable<R>,
    retired: Receiver<RawFd>,
    recycle_failures: u64,
}

impl<P: Preview, R> HandoffPipeline<P, R> {
    /// Wires the done callback of `preview` into the pipeline and returns
    /// the assembled coordinator.
    pub fn new(mut preview: P) -> Self {
        let (tx, retired) = channel();
        preview.set_done_callback(Box::new(move |fd| {
            if tx.send(fd).is_err() {
                warn!("pipeline gone, retired buffer fd {} lost", fd);
            }
        }));

        Self {
            preview,
            inflight: InflightTable::new(),
            retired,
            recycle_failures: 0,
        }
    }

    /// Shows the completed buffer `fd` and parks `request` until the
    /// display retires it.
    ///
    /// A show failure is fatal: the request is dropped with the pipeline.
    pub fn present(
        &mut self,
        fd: RawFd,
        len: usize,
        info: &StreamInfo,
        request: R,
    ) -> Result<(), PipelineError> {
        self.preview.show(fd, len, info)?;
        self.inflight.record(fd, request);
        Ok(())
    }

    /// Resolves every retired buffer back to its parked request and hands
    /// it to `recycle`. Returns how many requests were resubmitted.
    ///
    /// Recycle failures are counted and logged; the pipeline continues
    /// with one fewer request in flight.
    pub fn drain_retired(
        &mut self,
        mut recycle: impl FnMut(R) -> Result<(), CaptureError>,
    ) -> usize {
        let mut recycled = 0;
        while let Ok(fd) = self.retired.try_recv() {
            match self.inflight.take(fd) {
                Some(request) => match recycle(request) {
                    Ok(()) => recycled += 1,
                    Err(e) => {
                        self.recycle_failures += 1;
                        warn!(
                            "failed to recycle buffer fd {}: {} ({} lost so far)",
                            fd, e, self.recycle_failures
                        );
                    }
                },
                None => warn!("retirement of unknown buffer fd {}", fd),
            }
        }
        recycled
    }

    /// Number of requests currently parked on the display side.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Requests lost to failed resubmissions since startup.
    pub fn recycle_failures(&self) -> u64 {
        self.recycle_failures
    }

    pub fn preview_mut(&mut self) -> &mut P {
        &mut self.preview
    }
}

impl<P: Preview> HandoffPipeline<P, Request> {
    /// Drives one completed capture request through the hand-off: show its
    /// buffer, park it, then recycle whatever the display retired.
    ///
    /// A completion whose buffer cannot be resolved is not shown; its
    /// request is recycled immediately so the capacity is not lost.
    pub fn handle_completed(
        &mut self,
        session: &mut CaptureSession<'_>,
        request: Request,
    ) -> Result<(), PipelineError> {
        match session.resolve_completed(&request) {
            Ok((fd, len)) => {
                let info = *session.stream_info();
                self.present(fd, len, &info, request)?;
            }
            Err(e) => {
                warn!("completed frame skipped: {}", e);
                if let Err(e) = session.recycle(request) {
                    self.recycle_failures += 1;
                    warn!("failed to recycle skipped request: {}", e);
                }
            }
        }

        self.drain_retired(|request| session.recycle(request));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::preview::DoneCallback;
    use crate::stream::{ColourSpace, StreamInfo, PIXEL_FORMAT_YUV420};

    /// Preview that retires the previous buffer on each show, like the
    /// plane flip does.
    #[derive(Default)]
    struct FakePreview {
        callback: Option<DoneCallback>,
        shown: Vec<RawFd>,
        last_fd: Option<RawFd>,
    }

    impl Preview for FakePreview {
        fn set_done_callback(&mut self, callback: DoneCallback) {
            self.callback = Some(callback);
        }

        fn show(&mut self, fd: RawFd, _len: usize, _info: &StreamInfo) -> Result<(), ShowError> {
            self.shown.push(fd);
            if let Some(previous) = self.last_fd {
                if previous != fd {
                    if let Some(callback) = self.callback.as_mut() {
                        callback(previous);
                    }
                }
            }
            self.last_fd = Some(fd);
            Ok(())
        }

        fn reset(&mut self) {
            self.last_fd = None;
        }

        fn max_image_size(&self) -> (u32, u32) {
            (4096, 4096)
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

    #[test]
    fn test_request_is_not_recycled_before_done() {
        let mut pipeline = HandoffPipeline::new(FakePreview::default());
        let info = test_info();

        pipeline.present(1, 460800, &info, "request-1").unwrap();

        let mut recycled = Vec::new();
        pipeline.drain_retired(|r| {
            recycled.push(r);
            Ok(())
        });
        // Buffer 1 is still on the plane: nothing may go back to capture.
        assert!(recycled.is_empty());
        assert_eq!(pipeline.in_flight(), 1);

        pipeline.present(2, 460800, &info, "request-2").unwrap();
        pipeline.drain_retired(|r| {
            recycled.push(r);
            Ok(())
        });
        assert_eq!(recycled, vec!["request-1"]);
        assert_eq!(pipeline.in_flight(), 1);
    }

    #[test]
    fn test_recycle_order_follows_show_order() {
        let mut pipeline = HandoffPipeline::new(FakePreview::default());
        let info = test_info();

        let mut recycled: Vec<RawFd> = Vec::new();
        for fd in 1..=5 {
            pipeline.present(fd, 460800, &info, fd).unwrap();
            pipeline.drain_retired(|r| {
                recycled.push(r);
                Ok(())
            });
        }
        assert_eq!(recycled, vec![1, 2, 3, 4]);
        // Buffer 5 stays parked until a further show.
        assert_eq!(pipeline.in_flight(), 1);
    }

    #[test]
    fn test_recycle_failure_reduces_capacity() {
        let mut pipeline = HandoffPipeline::new(FakePreview::default());
        let info = test_info();

        pipeline.present(1, 460800, &info, "request-1").unwrap();
        pipeline.present(2, 460800, &info, "request-2").unwrap();

        let recycled = pipeline.drain_retired(|_r| {
            Err(CaptureError::Queue(io::Error::from(io::ErrorKind::Other)))
        });
        assert_eq!(recycled, 0);
        assert_eq!(pipeline.recycle_failures(), 1);
        // The failed request is gone; the in-flight one is untouched.
        assert_eq!(pipeline.in_flight(), 1);
    }

    #[test]
    fn test_inflight_table_refuses_shared_buffer() {
        let table = InflightTable::new();
        table.record(3, "a");
        table.record(3, "b");
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(3), Some("b"));
        assert!(table.is_empty());
    }
}
