//! Lossless segment concatenation

use super::tool::{MediaTool, ToolError};
use super::types::ConsolidateError;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Joins sealed segments into one file without re-encoding
pub trait SegmentComposer: Send + Sync {
    /// Concatenate `segments`, in order, into `output`
    fn compose(&self, segments: &[PathBuf], output: &Path) -> Result<(), ConsolidateError>;
}

/// Composer backed by the ffmpeg concat demuxer
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    tool: MediaTool,
}

impl FfmpegConcat {
    pub fn new(tool: MediaTool) -> Self {
        Self { tool }
    }

    /// Audio tracks present in every segment, capped at two
    fn common_audio_tracks(&self, segments: &[PathBuf]) -> Result<usize, ConsolidateError> {
        let mut common: Option<usize> = None;
        for path in segments {
            let probe_failed = |e: ToolError| ConsolidateError::Probe {
                path: path.clone(),
                reason: e.to_string(),
            };
            let audio = match self.tool.probe(path) {
                Ok(probe) if !probe.has_video() => {
                    return Err(ConsolidateError::MissingTrack {
                        path: path.clone(),
                        track: "video",
                    });
                }
                Ok(probe) => probe.audio_streams(),
                // No ffprobe; ffmpeg's own banner still lists the streams.
                Err(ToolError::Unavailable(_)) => {
                    self.tool.audio_stream_count(path).map_err(probe_failed)?
                }
                Err(e) => return Err(probe_failed(e)),
            };
            if common.is_some_and(|c| c != audio) {
                tracing::warn!(
                    "{} has {} audio track(s), others differ; keeping the common ones",
                    path.display(),
                    audio
                );
            }
            common = Some(common.map_or(audio, |c| c.min(audio)));
        }
        Ok(common.unwrap_or(0).min(2))
    }
}

impl SegmentComposer for FfmpegConcat {
    fn compose(&self, segments: &[PathBuf], output: &Path) -> Result<(), ConsolidateError> {
        if segments.is_empty() {
            return Err(ConsolidateError::NoSegments);
        }
        if !self.tool.is_available() {
            return Err(ConsolidateError::ToolUnavailable);
        }

        let audio_tracks = self.common_audio_tracks(segments)?;
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let mut list = tempfile::Builder::new()
            .prefix(".concat-")
            .suffix(".txt")
            .tempfile_in(dir)?;
        list.write_all(concat_list(segments).as_bytes())?;
        list.flush()?;

        tracing::info!(
            "Joining {} segments with {} audio track(s) into {}",
            segments.len(),
            audio_tracks,
            output.display()
        );
        self.tool
            .concat(list.path(), output, audio_tracks)
            .map_err(|e| ConsolidateError::ExportFailed(e.to_string()))?;

        if !output.exists() {
            return Err(ConsolidateError::ExportFailed(format!(
                "ffmpeg reported success but {} is missing",
                output.display()
            )));
        }
        Ok(())
    }
}

/// Render a concat demuxer list; paths are made absolute and quoted
pub fn concat_list(segments: &[PathBuf]) -> String {
    let mut list = String::new();
    for path in segments {
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    list
}
