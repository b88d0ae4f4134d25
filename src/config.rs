//! Recorder configuration
//!
//! Loaded from an optional JSON file; every field has a default so partial
//! files work. Tool paths can also be overridden from the environment.

use crate::capture::{CaptureRequest, DisplayMetadata, SampleKind};
use crate::meter::LevelMeterConfig;
use crate::processing::ToolConfig;
use crate::recorder::{ContainerSpec, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the ffmpeg binary
pub const FFMPEG_ENV: &str = "SCREENTAPE_FFMPEG";
/// Environment variable overriding the ffprobe binary
pub const FFPROBE_ENV: &str = "SCREENTAPE_FFPROBE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Maximum span of one segment file
    pub segment_duration_secs: u64,
    /// Frame rate cap for the video track
    pub max_fps: u32,
    /// Video bitrate in bits per second
    pub video_bitrate: u32,
    /// ffmpeg encoder used for segment video
    pub video_encoder: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Per-track AAC bitrate inside segments
    pub audio_bitrate: u32,
    /// AAC bitrate of the mixed track in the final file
    pub mixed_audio_bitrate: u32,
    /// LAME VBR quality for the MP3 sidecar (0 best, 9 worst)
    pub sidecar_quality: u8,
    /// Frames buffered per segment before the video track reports not ready
    pub encoder_queue_depth: usize,
    /// Samples of all kinds waiting for the writer before new ones are dropped
    pub inbox_capacity: usize,
    pub level: LevelMeterConfig,
    pub tools: ToolConfig,
    /// Loopback input device carrying system audio, if any
    pub system_audio_device: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 120,
            max_fps: 30,
            video_bitrate: 8_000_000,
            video_encoder: default_video_encoder().to_string(),
            audio_sample_rate: 48_000,
            audio_channels: 2,
            audio_bitrate: 128_000,
            mixed_audio_bitrate: 192_000,
            sidecar_quality: 2,
            encoder_queue_depth: 8,
            inbox_capacity: 90,
            level: LevelMeterConfig::default(),
            tools: ToolConfig::default(),
            system_audio_device: None,
        }
    }
}

fn default_video_encoder() -> &'static str {
    if cfg!(target_os = "macos") {
        "h264_videotoolbox"
    } else {
        "libx264"
    }
}

impl RecorderConfig {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply `SCREENTAPE_FFMPEG` / `SCREENTAPE_FFPROBE`
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ffmpeg) = std::env::var_os(FFMPEG_ENV).filter(|v| !v.is_empty()) {
            self.tools.ffmpeg = PathBuf::from(ffmpeg);
        }
        if let Some(ffprobe) = std::env::var_os(FFPROBE_ENV).filter(|v| !v.is_empty()) {
            self.tools.ffprobe = PathBuf::from(ffprobe);
        }
        self
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs.max(1))
    }

    pub fn capture_request(&self, session: &SessionConfig) -> CaptureRequest {
        CaptureRequest {
            display_id: session.display_id,
            microphone_id: session.microphone_id.clone(),
            max_fps: self.max_fps.max(1),
            sample_rate: self.audio_sample_rate,
            channels: self.audio_channels,
            shows_cursor: true,
        }
    }

    /// Container settings shared by every segment of a session
    pub fn container_template(
        &self,
        metadata: &DisplayMetadata,
        audio_tracks: Vec<SampleKind>,
    ) -> ContainerSpec {
        ContainerSpec {
            path: PathBuf::new(),
            width: metadata.width,
            height: metadata.height,
            fps: metadata.fps.clamp(1, self.max_fps.max(1)),
            video_bitrate: self.video_bitrate,
            audio_tracks,
            sample_rate: self.audio_sample_rate,
            channels: self.audio_channels,
            audio_bitrate: self.audio_bitrate,
        }
    }
}
