//! macOS screen capture using CoreGraphics
//!
//! Frames are grabbed from the display at the session frame rate on a
//! dedicated thread and delivered as tightly packed BGRA.

use crate::capture::traits::{DisplayInfo, DisplayMetadata, SessionClock, StreamEnd};
use crate::capture::{CaptureError, SourceOutputs};
use core_foundation::data::CFData;
use core_graphics::display::CGDisplay;
use core_graphics::image::CGImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Seconds of consecutive failed grabs before the stream is declared over
const GRAB_FAILURE_LIMIT_SECS: u32 = 2;

/// Get list of available displays
pub fn get_displays() -> Vec<DisplayInfo> {
    let display_ids = CGDisplay::active_displays().unwrap_or_default();

    display_ids
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            let display = CGDisplay::new(id);
            let bounds = display.bounds();
            let is_main = display.is_main();

            let refresh_rate = display
                .display_mode()
                .map(|mode| mode.refresh_rate() as u32)
                .filter(|&r| r > 0);

            DisplayInfo {
                id,
                name: if is_main {
                    "Main Display".to_string()
                } else {
                    format!("Display {}", index + 1)
                },
                width: bounds.size.width as u32,
                height: bounds.size.height as u32,
                scale_factor: display.pixels_high() as f64 / bounds.size.height.max(1.0),
                is_primary: is_main,
                refresh_rate,
            }
        })
        .collect()
}

/// Pick the requested display, or the primary one
pub fn resolve_display(requested: Option<u32>) -> Result<DisplayInfo, CaptureError> {
    let displays = get_displays();
    let chosen = match requested {
        Some(id) => displays.into_iter().find(|d| d.id == id),
        None => {
            let primary = displays.iter().position(|d| d.is_primary).unwrap_or(0);
            displays.into_iter().nth(primary)
        }
    };
    chosen.ok_or(CaptureError::NoCaptureableDisplay)
}

/// Copy a CGImage into tightly packed BGRA rows
fn image_to_bgra(image: &CGImage) -> Option<(u32, u32, Vec<u8>)> {
    if image.bits_per_pixel() != 32 {
        return None;
    }
    let width = image.width();
    let height = image.height();
    let stride = image.bytes_per_row();
    let data: CFData = image.data();
    let bytes = data.bytes();

    let row_len = width * 4;
    if stride < row_len || bytes.len() < stride * height {
        return None;
    }

    let mut out = Vec::with_capacity(row_len * height);
    for row in bytes.chunks(stride).take(height) {
        out.extend_from_slice(&row[..row_len]);
    }
    Some((width as u32, height as u32, out))
}

/// Grab one frame to learn the capture size
pub fn probe_display(display: &DisplayInfo, max_fps: u32) -> Result<DisplayMetadata, CaptureError> {
    let image = CGDisplay::new(display.id).image().ok_or_else(|| {
        CaptureError::SetupFailed(format!("could not read display {}", display.id))
    })?;
    let (width, height, _) = image_to_bgra(&image).ok_or_else(|| {
        CaptureError::SetupFailed(format!("display {} has an unsupported pixel format", display.id))
    })?;

    let fps = display
        .refresh_rate
        .map_or(max_fps, |rate| rate.min(max_fps))
        .max(1);
    Ok(DisplayMetadata {
        display_id: display.id,
        width,
        height,
        fps,
    })
}

/// Frame grabber thread for one display
pub struct ScreenGrabber {
    is_recording: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScreenGrabber {
    pub fn start(metadata: DisplayMetadata, outputs: SourceOutputs) -> Result<Self, CaptureError> {
        let is_recording = Arc::new(AtomicBool::new(true));
        let running = is_recording.clone();
        let thread = std::thread::Builder::new()
            .name(format!("screen-{}", metadata.display_id))
            .spawn(move || grab_loop(metadata, outputs, running))?;

        tracing::info!("Display capture started for display {}", metadata.display_id);
        Ok(Self {
            is_recording,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.is_recording.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!("Display capture stopped");
    }
}

fn grab_loop(metadata: DisplayMetadata, outputs: SourceOutputs, running: Arc<AtomicBool>) {
    let display = CGDisplay::new(metadata.display_id);
    let clock: SessionClock = outputs.clock;
    let fps = metadata.fps.max(1) as u64;
    let failure_limit = GRAB_FAILURE_LIMIT_SECS * metadata.fps.max(1);
    let mut frame = 0u64;
    let mut failures = 0u32;
    let mut resized_warned = false;

    while running.load(Ordering::SeqCst) {
        let due = Duration::from_nanos(frame * 1_000_000_000 / fps);
        let now = clock.now();
        if due > now {
            std::thread::sleep(due - now);
        } else {
            // Fell behind; skip ahead instead of bursting.
            frame = now.as_nanos() as u64 * fps / 1_000_000_000;
        }
        frame += 1;

        let pts = clock.now();
        let grabbed = display.image().and_then(|image| image_to_bgra(&image));
        let Some((width, height, pixels)) = grabbed else {
            failures += 1;
            if failures >= failure_limit {
                let end = if super::permissions::has_screen_recording_permission() {
                    StreamEnd::Failed(format!("display {} stopped delivering frames", metadata.display_id))
                } else {
                    StreamEnd::UserStopped
                };
                outputs.stop.fire(end);
                break;
            }
            continue;
        };
        failures = 0;

        if width != metadata.width || height != metadata.height {
            if !resized_warned {
                tracing::warn!(
                    "Display {} changed to {}x{}, skipping frames",
                    metadata.display_id,
                    width,
                    height
                );
                resized_warned = true;
            }
            continue;
        }

        outputs.video.send(pts, pixels);
    }
}
