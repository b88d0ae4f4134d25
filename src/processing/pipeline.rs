//! Post-processing pipeline
//!
//! Runs once per session after every segment is sealed:
//!
//! 1. Collect the sealed segment files in order.
//! 2. Consolidate them into the final file (rename or lossless concat).
//! 3. Mix the system and microphone tracks into a single track.
//! 4. Export the MP3 sidecar, if requested.
//! 5. Remove the segment files.
//!
//! Only a failed consolidation is fatal. Mix and sidecar failures leave a
//! usable file and are reported as warnings.

use super::compose::SegmentComposer;
use super::tool::{MediaTool, ToolError};
use super::types::{ConsolidateError, PipelineOutcome, PipelineReport, PipelineStage};
use crate::recorder::{FinalizedSegment, Segment};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Everything the pipeline needs from a stopped session
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub session_id: Uuid,
    /// Sealing results, in segment order
    pub segments: Vec<FinalizedSegment>,
    /// Closed segment time ranges
    pub timeline: Vec<Segment>,
    pub output_path: PathBuf,
    pub segment_dir: PathBuf,
    pub sidecar_path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct PostProcessor {
    tool: MediaTool,
    composer: Arc<dyn SegmentComposer>,
    mixed_audio_bitrate: u32,
    sidecar_quality: u8,
}

impl PostProcessor {
    pub fn new(
        tool: MediaTool,
        composer: Arc<dyn SegmentComposer>,
        mixed_audio_bitrate: u32,
        sidecar_quality: u8,
    ) -> Self {
        Self {
            tool,
            composer,
            mixed_audio_bitrate,
            sidecar_quality,
        }
    }

    /// Run every stage and report what happened. Blocking.
    pub fn run(&self, plan: PipelinePlan) -> PipelineReport {
        let mut report = PipelineReport::new(plan.session_id);
        report.segments = plan.timeline.clone();

        tracing::info!("Post-processing session {}", plan.session_id);
        let segments = self.collect(&plan, &mut report);

        if plan.segments.is_empty() {
            tracing::info!("No frames were captured, nothing to process");
            remove_segment_dir(&plan.segment_dir);
            report.outcome = PipelineOutcome::NoRecording;
            return report;
        }

        tracing::info!("{:?}: {} segment(s)", PipelineStage::Consolidate, segments.len());
        if let Err(e) = self.consolidate(&segments, &plan.output_path) {
            tracing::error!("Consolidation failed, segments kept in {}: {}", plan.segment_dir.display(), e);
            report.outcome = PipelineOutcome::Failed {
                reason: e.to_string(),
            };
            return report;
        }
        report.segment_count = segments.len();
        report.output = Some(plan.output_path.clone());

        let tool_available = self.tool.is_available();
        if tool_available {
            match self.mix(&plan.output_path) {
                Ok(mixed) => report.audio_mixed = mixed,
                Err(e) => report.warn(PipelineStage::Mix, format!("audio tracks left unmixed: {e}")),
            }
        } else {
            tracing::info!("ffmpeg not available, leaving audio tracks as recorded");
        }

        if let Some(sidecar) = &plan.sidecar_path {
            if !tool_available {
                report.warn(PipelineStage::Sidecar, "MP3 sidecar skipped: ffmpeg not available");
            } else {
                match self
                    .tool
                    .export_audio(&plan.output_path, sidecar, self.sidecar_quality)
                {
                    Ok(()) => report.sidecar = Some(sidecar.clone()),
                    Err(e) => {
                        let _ = std::fs::remove_file(sidecar);
                        report.warn(PipelineStage::Sidecar, format!("MP3 sidecar failed: {e}"));
                    }
                }
            }
        }

        tracing::debug!("{:?}: {}", PipelineStage::Cleanup, plan.segment_dir.display());
        remove_segment_dir(&plan.segment_dir);

        report.outcome = if report.warnings.is_empty() {
            PipelineOutcome::Completed
        } else {
            PipelineOutcome::Degraded
        };
        tracing::info!(
            "Session {} processed: {:?} -> {}",
            plan.session_id,
            report.outcome,
            plan.output_path.display()
        );
        report
    }

    /// Sealed segment files that exist on disk, in order
    fn collect(&self, plan: &PipelinePlan, report: &mut PipelineReport) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(plan.segments.len());
        for finalized in &plan.segments {
            let path = &finalized.segment.path;
            if let Some(error) = &finalized.error {
                report.warn(
                    PipelineStage::Collect,
                    format!("segment {} skipped: {}", finalized.segment.index, error),
                );
            } else if !path.exists() {
                report.warn(
                    PipelineStage::Collect,
                    format!("segment {} skipped: {} is missing", finalized.segment.index, path.display()),
                );
            } else {
                paths.push(path.clone());
            }
        }
        paths
    }

    fn consolidate(&self, segments: &[PathBuf], output: &Path) -> Result<(), ConsolidateError> {
        match segments {
            [] => Err(ConsolidateError::NoSegments),
            [only] => {
                if !only.exists() {
                    return Err(ConsolidateError::MissingSegment(only.clone()));
                }
                move_file(only, output)?;
                Ok(())
            }
            many => {
                remove_if_exists(output)?;
                self.composer.compose(many, output)
            }
        }
    }

    /// Replace `output` with a copy whose two audio tracks are mixed.
    ///
    /// Returns false when there was nothing to mix.
    fn mix(&self, output: &Path) -> Result<bool, ToolError> {
        let tracks = self.tool.audio_stream_count(output)?;
        if tracks < 2 {
            tracing::debug!("{} audio track(s), nothing to mix", tracks);
            return Ok(false);
        }
        if tracks > 2 {
            tracing::warn!("{} audio tracks found, mixing the first two", tracks);
        }

        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let mixed = tempfile::Builder::new()
            .prefix(".mix-")
            .suffix(".mp4")
            .tempfile_in(dir)?;
        self.tool
            .mix_audio(output, mixed.path(), self.mixed_audio_bitrate)?;
        mixed.persist(output).map_err(|e| ToolError::Io(e.error))?;
        Ok(true)
    }
}

/// Rename, falling back to copy across filesystems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    remove_if_exists(to)?;
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_segment_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
