//! The camera side of the pipeline: stream configuration, buffer
//! allocation and the capture request pool.
//!
//! Every allocated buffer is bound to exactly one request for the life of
//! the session. A completed request is recycled with the same buffer still
//! attached, so in-flight capacity is fixed once the pool is built and no
//! allocation happens on the steady-state path.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::mpsc::Sender;

use libcamera::camera::{ActiveCamera, Camera, CameraConfiguration, CameraConfigurationStatus};
use libcamera::framebuffer::AsFrameBuffer;
use libcamera::framebuffer_allocator::{FrameBuffer, FrameBufferAllocator};
use libcamera::geometry::Size;
use libcamera::pixel_format::PixelFormat;
use libcamera::request::{Request, RequestStatus, ReuseFlag};
use libcamera::stream::{Stream, StreamRole};
use log::{debug, info, warn};
use thiserror::Error;

use crate::mapping::{MapError, MappedBufferPool};
use crate::stream::{ColourSpace, StreamInfo, PIXEL_FORMAT_YUV420};

/// Capture-side configuration.
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    /// Number of kernel buffers, and so of requests in flight. Six keeps
    /// the sensor fed while a frame sits on the display and another is in
    /// hand-off.
    pub buffer_count: u32,
    pub colour_space: ColourSpace,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            buffer_count: 6,
            colour_space: ColourSpace::Rec709,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to acquire camera: {0}")]
    Acquire(io::Error),
    #[error("camera offered no configuration for a video stream")]
    NoConfiguration,
    #[error("stream configuration rejected by the camera")]
    InvalidConfiguration,
    #[error("failed to configure camera: {0}")]
    Configure(io::Error),
    #[error("camera insists on {0:?}, only YUV420 can be scanned out")]
    UnsupportedFormat(PixelFormat),
    #[error("configured stream is unavailable")]
    NoStream,
    #[error("failed to allocate capture buffers: {0}")]
    Alloc(io::Error),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("failed to create capture request")]
    CreateRequest,
    #[error("failed to attach buffer to request: {0}")]
    AttachBuffer(io::Error),
    #[error("failed to start camera: {0}")]
    Start(io::Error),
    #[error("failed to queue request: {0}")]
    Queue(io::Error),
    #[error("completed request carries no buffer for the active stream")]
    MissingBuffer,
    #[error("buffer fd {0} has no recorded mapping, frame is not capturable")]
    NotCapturable(RawFd),
}

/// Returns whether a completed request should enter the hand-off path.
///
/// A cancelled completion (normal during shutdown) is consumed here with no
/// further processing.
pub(crate) fn completion_is_usable(status: RequestStatus) -> bool {
    if status == RequestStatus::Cancelled {
        debug!("cancelled capture request dropped");
        return false;
    }
    true
}

/// An acquired and configured camera with its buffer and request pools.
///
/// Completion callbacks are delivered on libcamera's own dispatch thread;
/// they are forwarded through the channel handed to [`CaptureSession::start`]
/// rather than processed in the callback.
pub struct CaptureSession<'d> {
    camera: ActiveCamera<'d>,
    // Keeps the kernel buffers alive; requests only borrow them.
    _allocator: FrameBufferAllocator,
    _config: CameraConfiguration,
    stream: Stream,
    info: StreamInfo,
    pool: MappedBufferPool,
    // Requests built but not yet submitted; drained by start().
    idle: Vec<Request>,
}

impl<'d> CaptureSession<'d> {
    /// Acquires `camera`, applies `config` to its video stream, allocates
    /// and maps the buffer pool and builds one request per buffer.
    ///
    /// Every failure in here is a fatal startup condition: there is no
    /// partially usable session.
    pub fn new(camera: &Camera<'d>, config: &PipelineConfig) -> Result<Self, CaptureError> {
        let mut active = camera.acquire().map_err(CaptureError::Acquire)?;

        let mut camera_config = camera
            .generate_configuration(&[StreamRole::VideoRecording])
            .ok_or(CaptureError::NoConfiguration)?;
        {
            let mut stream_config = camera_config
                .get_mut(0)
                .ok_or(CaptureError::NoConfiguration)?;
            stream_config.set_pixel_format(PIXEL_FORMAT_YUV420);
            stream_config.set_size(Size::new(config.width, config.height));
            stream_config.set_buffer_count(config.buffer_count);
        }

        match camera_config.validate() {
            CameraConfigurationStatus::Valid => (),
            CameraConfigurationStatus::Adjusted => warn!("stream configuration adjusted"),
            CameraConfigurationStatus::Invalid => {
                return Err(CaptureError::InvalidConfiguration)
            }
        }
        active
            .configure(&mut camera_config)
            .map_err(CaptureError::Configure)?;

        // Geometry is frozen from here on; both pipeline halves interpret
        // buffer contents through this value.
        let stream_config = camera_config.get(0).ok_or(CaptureError::NoConfiguration)?;
        let size = stream_config.get_size();
        let info = StreamInfo {
            width: size.width,
            height: size.height,
            stride: stream_config.get_stride(),
            pixel_format: stream_config.get_pixel_format(),
            colour_space: config.colour_space,
        };
        if info.pixel_format.fourcc() != PIXEL_FORMAT_YUV420.fourcc() {
            return Err(CaptureError::UnsupportedFormat(info.pixel_format));
        }
        let stream = stream_config.stream().ok_or(CaptureError::NoStream)?;

        let mut allocator = FrameBufferAllocator::new(camera);
        let buffers = allocator.alloc(&stream).map_err(CaptureError::Alloc)?;
        if buffers.is_empty() {
            return Err(CaptureError::Alloc(io::Error::from(
                io::ErrorKind::OutOfMemory,
            )));
        }

        let mut pool = MappedBufferPool::new();
        let mut idle = Vec::with_capacity(buffers.len());
        for (cookie, buffer) in buffers.into_iter().enumerate() {
            pool.map_buffer(&buffer)?;

            let mut request = active
                .create_request(Some(cookie as u64))
                .ok_or(CaptureError::CreateRequest)?;
            request
                .add_buffer(&stream, buffer)
                .map_err(CaptureError::AttachBuffer)?;
            idle.push(request);
        }
        info!(
            "{} buffers allocated and mapped, {}x{} stride {}",
            pool.len(),
            info.width,
            info.height,
            info.stride
        );

        Ok(Self {
            camera: active,
            _allocator: allocator,
            _config: camera_config,
            stream,
            info,
            pool,
            idle,
        })
    }

    /// Starts the camera with its control defaults, registers the
    /// completion handler and submits every pooled request.
    ///
    /// Completed requests that are not cancelled appear on `completed`.
    pub fn start(&mut self, completed: Sender<Request>) -> Result<(), CaptureError> {
        self.camera.start(None).map_err(CaptureError::Start)?;

        self.camera.on_request_completed(move |request| {
            if !completion_is_usable(request.status()) {
                return;
            }
            if completed.send(request).is_err() {
                // The pipeline is tearing down; the request is dropped
                // with its buffer and the camera stops seeing it.
                warn!("completion receiver gone, dropping completed request");
            }
        });

        for request in self.idle.drain(..) {
            self.camera
                .queue_request(request)
                .map_err(CaptureError::Queue)?;
        }

        Ok(())
    }

    /// Re-arms a completed request with its buffer still attached and
    /// resubmits it.
    ///
    /// A queue failure here is not fatal to the pipeline; the caller loses
    /// one request of in-flight capacity and carries on.
    pub fn recycle(&mut self, mut request: Request) -> Result<(), CaptureError> {
        request.reuse(ReuseFlag::REUSE_BUFFERS);
        self.camera
            .queue_request(request)
            .map_err(CaptureError::Queue)
    }

    /// Resolves a completed request to its buffer identity and mapped byte
    /// length.
    pub fn resolve_completed(&self, request: &Request) -> Result<(RawFd, usize), CaptureError> {
        let buffer: &FrameBuffer = request
            .buffer(&self.stream)
            .ok_or(CaptureError::MissingBuffer)?;
        let fd = buffer
            .planes()
            .into_iter()
            .next()
            .ok_or(CaptureError::MissingBuffer)?
            .fd();

        let len = self.pool.total_len(fd);
        if len == 0 {
            return Err(CaptureError::NotCapturable(fd));
        }
        Ok((fd, len))
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn mapped_buffers(&self) -> &MappedBufferPool {
        &self.pool
    }

    /// Number of requests the pool was built with.
    pub fn request_count(&self) -> usize {
        self.pool.len()
    }

    /// Stops the capture pipeline. In-flight requests complete as
    /// cancelled and are consumed by the completion handler.
    pub fn stop(&mut self) {
        if let Err(e) = self.camera.stop() {
            warn!("error stopping camera: {}", e);
        }
    }
}
