//! Recording state management
//!
//! Defines the session state machine and the per-session file layout.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory, under the output directory, holding segment files
pub const SEGMENT_DIR_NAME: &str = "segments";

const DEFAULT_STEM_FORMAT: &str = "Recording %Y-%m-%d at %H.%M.%S";

/// Lifecycle of one recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Not started yet
    #[default]
    Idle,
    /// Source is being negotiated
    Starting,
    /// Samples are flowing into segments
    Recording,
    /// Capture is being torn down
    Stopping,
    /// Segments are being consolidated
    Processing,
    /// Post-processing finished
    Done,
    /// Setup or post-processing failed
    Failed,
}

impl SessionState {
    /// Whether the session still owns the capture hardware
    pub fn is_capturing(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Recording | SessionState::Stopping
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Display to capture; the primary display when unset
    #[serde(default)]
    pub display_id: Option<u32>,

    /// Microphone device; no microphone track when unset
    #[serde(default)]
    pub microphone_id: Option<String>,

    /// Directory receiving the final file
    pub output_dir: PathBuf,

    /// Final file name without extension; timestamped when unset
    #[serde(default)]
    pub file_stem: Option<String>,

    /// Also export an MP3 of the mixed audio
    #[serde(default)]
    pub sidecar_audio: bool,
}

impl SessionConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            display_id: None,
            microphone_id: None,
            output_dir: output_dir.into(),
            file_stem: None,
            sidecar_audio: false,
        }
    }

    pub fn with_display(mut self, display_id: u32) -> Self {
        self.display_id = Some(display_id);
        self
    }

    pub fn with_microphone(mut self, microphone_id: impl Into<String>) -> Self {
        self.microphone_id = Some(microphone_id.into());
        self
    }

    pub fn with_file_stem(mut self, stem: impl Into<String>) -> Self {
        self.file_stem = Some(stem.into());
        self
    }

    pub fn with_sidecar_audio(mut self, enabled: bool) -> Self {
        self.sidecar_audio = enabled;
        self
    }
}

/// Information about one recording attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: Uuid,
    pub display_id: Option<u32>,
    pub microphone_id: Option<String>,
    /// Final consolidated file
    pub output_path: PathBuf,
    /// Directory holding this session's segments
    pub segment_dir: PathBuf,
    /// MP3 sidecar, when requested
    pub sidecar_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl CaptureSession {
    pub fn from_config(config: &SessionConfig) -> Self {
        let stem = config
            .file_stem
            .clone()
            .filter(|stem| !stem.trim().is_empty())
            .unwrap_or_else(|| default_file_stem(Local::now()));
        let output_dir = config.output_dir.as_path();

        Self {
            id: Uuid::new_v4(),
            display_id: config.display_id,
            microphone_id: config.microphone_id.clone(),
            output_path: output_dir.join(format!("{stem}.mp4")),
            segment_dir: segment_dir_for(output_dir),
            sidecar_path: config
                .sidecar_audio
                .then(|| output_dir.join(format!("{stem}.mp3"))),
            created_at: Utc::now(),
        }
    }
}

pub fn segment_dir_for(output_dir: &Path) -> PathBuf {
    output_dir.join(SEGMENT_DIR_NAME)
}

fn default_file_stem(now: DateTime<Local>) -> String {
    now.format(DEFAULT_STEM_FORMAT).to_string()
}
