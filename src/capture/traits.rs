//! Capture trait definitions
//!
//! Platform-agnostic types for the sources that feed a recording session.

use super::delivery::SourceOutputs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Information about a display/screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    /// Display name
    pub name: String,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Whether this is the primary display
    pub is_primary: bool,

    /// Refresh rate in Hz (if available)
    pub refresh_rate: Option<u32>,
}

/// Information about an audio device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Whether this is an input device
    pub is_input: bool,

    /// Whether this is the default device
    pub is_default: bool,
}

/// Capture geometry negotiated by a started source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetadata {
    pub display_id: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Which delivery channel a sample arrived on.
///
/// The audio kinds double as track identifiers inside a segment container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleKind {
    Video,
    SystemAudio,
    MicAudio,
}

impl SampleKind {
    pub fn is_audio(&self) -> bool {
        !matches!(self, SampleKind::Video)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SampleKind::Video => "video",
            SampleKind::SystemAudio => "system",
            SampleKind::MicAudio => "mic",
        }
    }
}

/// A time-stamped chunk of media.
///
/// Video payloads are tightly packed BGRA rows at the negotiated capture size.
/// Audio payloads are interleaved little-endian `f32` PCM at the session's
/// sample rate and channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub kind: SampleKind,
    /// Presentation time relative to the session clock
    pub pts: Duration,
    pub data: Vec<u8>,
}

impl SampleBuffer {
    pub fn new(kind: SampleKind, pts: Duration, data: Vec<u8>) -> Self {
        Self { kind, pts, data }
    }

    /// Build an audio buffer from interleaved float samples
    pub fn from_f32(kind: SampleKind, pts: Duration, samples: &[f32]) -> Self {
        Self::new(kind, pts, f32_to_bytes(samples))
    }
}

/// Encode float PCM as little-endian bytes
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Monotonic clock shared by every channel of one session
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the session clock started
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::start()
    }
}

/// What a session asks its source to capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Display to capture; `None` picks the primary display
    pub display_id: Option<u32>,
    /// Microphone to record; `None` disables the microphone track
    pub microphone_id: Option<String>,
    pub max_fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub shows_cursor: bool,
}

/// Why a platform stream ended without being asked to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The user stopped sharing from the system UI
    UserStopped,
    /// The stream failed
    Failed(String),
}

impl StreamEnd {
    pub fn is_benign(&self) -> bool {
        matches!(self, StreamEnd::UserStopped)
    }
}

/// Errors raised while setting up or running a capture
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No capturable display available")]
    NoCaptureableDisplay,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture setup failed: {0}")]
    SetupFailed(String),

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("Segment directory is still used by another session: {}", .0.display())]
    SegmentDirectoryBusy(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform bridge that delivers video, system audio and microphone samples.
///
/// Samples are pushed into the [`SourceOutputs`] handed to `start`. Delivery
/// happens on whatever threads the platform uses; the outputs never block.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Negotiate capture and begin delivering samples
    async fn start(
        &self,
        request: &CaptureRequest,
        outputs: SourceOutputs,
    ) -> Result<DisplayMetadata, CaptureError>;

    /// Stop delivery. A no-op when nothing is running.
    async fn stop(&self);

    /// Audio tracks the running capture delivers, system audio first.
    ///
    /// Asked once `start` has succeeded; every segment of the session
    /// carries exactly these tracks.
    fn audio_tracks(&self, request: &CaptureRequest) -> Vec<SampleKind> {
        let mut tracks = vec![SampleKind::SystemAudio];
        if request.microphone_id.is_some() {
            tracks.push(SampleKind::MicAudio);
        }
        tracks
    }

    /// Microphones this source can record from, default device first
    fn list_microphones(&self) -> Vec<AudioDeviceInfo> {
        Vec::new()
    }

    /// Displays this source can capture
    fn list_displays(&self) -> Vec<DisplayInfo> {
        Vec::new()
    }
}
