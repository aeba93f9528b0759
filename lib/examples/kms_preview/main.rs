use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Context};
use camkms::capture::{CaptureSession, PipelineConfig};
use camkms::display::DrmPreview;
use camkms::legacy;
use camkms::pipeline::HandoffPipeline;
use camkms::preview::Preview;
use clap::{App, Arg};
use libcamera::camera_manager::CameraManager;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("KMS camera preview")
        .arg(
            Arg::with_name("device")
                .long("device")
                .takes_value(true)
                .default_value("/dev/dri/card0")
                .help("DRM device node to scan out on"),
        )
        .arg(
            Arg::with_name("width")
                .long("width")
                .takes_value(true)
                .default_value("1280")
                .help("Capture width in pixels"),
        )
        .arg(
            Arg::with_name("height")
                .long("height")
                .takes_value(true)
                .default_value("720")
                .help("Capture height in pixels"),
        )
        .arg(
            Arg::with_name("buffers")
                .long("buffers")
                .takes_value(true)
                .default_value("6")
                .help("Number of capture buffers in flight"),
        )
        .get_matches();

    let device = matches.value_of("device").expect("Device not specified");
    let width: u32 = matches
        .value_of("width")
        .unwrap()
        .parse()
        .context("Invalid width")?;
    let height: u32 = matches
        .value_of("height")
        .unwrap()
        .parse()
        .context("Invalid height")?;
    let buffer_count: u32 = matches
        .value_of("buffers")
        .unwrap()
        .parse()
        .context("Invalid buffer count")?;

    if legacy::legacy_stack_present() {
        bail!("the system appears to be configured for the legacy camera stack");
    }

    let preview = DrmPreview::open(Path::new(device))?;
    let (max_width, max_height) = preview.max_image_size();
    if width > max_width || height > max_height {
        bail!(
            "requested {}x{} exceeds the device maximum of {}x{}",
            width,
            height,
            max_width,
            max_height
        );
    }

    let manager = CameraManager::new().context("Failed to start the camera manager")?;
    let cameras = manager.cameras();
    let camera = cameras.get(0).context("No cameras found")?;

    let config = PipelineConfig {
        width,
        height,
        buffer_count,
        ..Default::default()
    };
    let mut session = CaptureSession::new(&camera, &config)?;
    let mut pipeline = HandoffPipeline::new(preview);

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = Arc::clone(&quit);
        ctrlc::set_handler(move || quit.store(true, Ordering::SeqCst))
            .expect("Failed to set Ctrl-C handler");
    }

    let (completed_tx, completed_rx) = mpsc::channel();
    session.start(completed_tx)?;
    println!("previewing {}x{} on {}", width, height, device);

    while !quit.load(Ordering::SeqCst) {
        match completed_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(request) => pipeline.handle_completed(&mut session, request)?,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    session.stop();
    pipeline.preview_mut().reset();

    Ok(())
}
