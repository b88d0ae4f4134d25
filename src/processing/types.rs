//! Post-processing types
//!
//! Stages, outcome and report produced after a session stops, plus the
//! errors raised while consolidating segments.

use crate::recorder::Segment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Post-processing stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStage {
    /// Gather sealed segment files
    Collect,
    /// Produce the single output file
    Consolidate,
    /// Fold the audio tracks into one
    Mix,
    /// Export the MP3 sidecar
    Sidecar,
    /// Remove segment files
    Cleanup,
}

/// How post-processing ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PipelineOutcome {
    /// Every stage succeeded
    Completed,
    /// Output exists but an optional stage was skipped or failed
    Degraded,
    /// Nothing was captured
    NoRecording,
    /// No output was produced; segments are left in place
    Failed { reason: String },
}

impl PipelineOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PipelineOutcome::Failed { .. })
    }
}

/// Result of processing one session, handed to the completion callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub session_id: Uuid,
    /// Final video file, when one was produced
    pub output: Option<PathBuf>,
    /// MP3 sidecar, when one was produced
    pub sidecar: Option<PathBuf>,
    /// Segments that went into the output
    pub segment_count: usize,
    /// Closed segments with their time ranges
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Whether the two audio tracks were folded into one
    pub audio_mixed: bool,
    pub outcome: PipelineOutcome,
    /// Problems that did not prevent an output
    pub warnings: Vec<String>,
}

impl PipelineReport {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            output: None,
            sidecar: None,
            segment_count: 0,
            segments: Vec::new(),
            audio_mixed: false,
            outcome: PipelineOutcome::NoRecording,
            warnings: Vec::new(),
        }
    }

    pub fn failed(session_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            outcome: PipelineOutcome::Failed {
                reason: reason.into(),
            },
            ..Self::new(session_id)
        }
    }

    pub(crate) fn warn(&mut self, stage: PipelineStage, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{:?}: {}", stage, message);
        self.warnings.push(message);
    }
}

/// Errors raised while producing the single output file
#[derive(Error, Debug)]
pub enum ConsolidateError {
    #[error("No segments to consolidate")]
    NoSegments,

    #[error("Segment file missing: {}", .0.display())]
    MissingSegment(PathBuf),

    #[error("Segment {} has no {track} track", path.display())]
    MissingTrack { path: PathBuf, track: &'static str },

    #[error("ffmpeg is required to join multiple segments but is not available")]
    ToolUnavailable,

    #[error("Could not inspect {}: {reason}", path.display())]
    Probe { path: PathBuf, reason: String },

    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
