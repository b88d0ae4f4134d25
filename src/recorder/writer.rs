//! Segment writer
//!
//! Wraps one open container file. The writer never blocks the caller: when a
//! track reports it cannot take more data the sample is dropped and counted.
//! Finalizing hands the container to a background thread and returns a
//! handle that resolves once the file is sealed.

use super::scheduler::Segment;
use crate::capture::{SampleBuffer, SampleKind};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Track {0:?} was not declared for this container")]
    UnknownTrack(SampleKind),

    #[error("No video was written to {}", .0.display())]
    Empty(PathBuf),
}

/// Settings for one segment container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: u32,
    /// Audio tracks in container order; system audio first when present
    pub audio_tracks: Vec<SampleKind>,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_bitrate: u32,
}

impl ContainerSpec {
    pub fn for_path(&self, path: PathBuf) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}

/// A container file being written.
///
/// Implementations may buffer internally but must not block in `append`.
pub trait ContainerWriter: Send {
    /// Anchor the container timeline at `at`
    fn start_session(&mut self, at: Duration) -> Result<(), WriterError>;

    fn is_ready_for_more_data(&self, track: SampleKind) -> bool;

    fn append(&mut self, sample: SampleBuffer) -> Result<(), WriterError>;

    /// Mark every track finished and seal the file. Blocks until done.
    fn finish(self: Box<Self>) -> Result<(), WriterError>;
}

/// Creates container writers for new segments
pub trait ContainerFactory: Send + Sync {
    fn create(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerWriter>, WriterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The track asked for back-pressure
    NotReady,
    /// Audio arrived before the first video frame
    SessionNotStarted,
    /// Sample predates the segment start
    BeforeSegmentStart,
    /// No such track in this container
    NoTrack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStats {
    pub appended: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub video: TrackStats,
    pub system_audio: TrackStats,
    pub mic_audio: TrackStats,
}

impl WriterStats {
    pub fn track(&self, kind: SampleKind) -> &TrackStats {
        match kind {
            SampleKind::Video => &self.video,
            SampleKind::SystemAudio => &self.system_audio,
            SampleKind::MicAudio => &self.mic_audio,
        }
    }

    fn record(&mut self, kind: SampleKind, outcome: AppendOutcome) {
        let track = match kind {
            SampleKind::Video => &mut self.video,
            SampleKind::SystemAudio => &mut self.system_audio,
            SampleKind::MicAudio => &mut self.mic_audio,
        };
        match outcome {
            AppendOutcome::Appended => track.appended += 1,
            AppendOutcome::Dropped(_) => track.dropped += 1,
        }
    }
}

pub struct SegmentWriter {
    segment: Segment,
    container: Box<dyn ContainerWriter>,
    audio_tracks: Vec<SampleKind>,
    session_start: Option<Duration>,
    stats: WriterStats,
}

impl SegmentWriter {
    /// Open the container for `segment`, replacing any file already there
    pub fn open(
        factory: &dyn ContainerFactory,
        segment: Segment,
        spec: ContainerSpec,
    ) -> Result<Self, WriterError> {
        match std::fs::remove_file(&segment.path) {
            Ok(()) => tracing::debug!("Replaced stale {}", segment.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let container = factory.create(&spec)?;
        tracing::info!(
            "Opened segment {} ({}x{} @ {}fps, audio {:?})",
            segment.index,
            spec.width,
            spec.height,
            spec.fps,
            spec.audio_tracks
        );

        Ok(Self {
            segment,
            container,
            audio_tracks: spec.audio_tracks,
            session_start: None,
            stats: WriterStats::default(),
        })
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn append_video(&mut self, sample: SampleBuffer) -> Result<AppendOutcome, WriterError> {
        let outcome = self.append_video_inner(sample)?;
        self.stats.record(SampleKind::Video, outcome);
        Ok(outcome)
    }

    pub fn append_system_audio(
        &mut self,
        sample: SampleBuffer,
    ) -> Result<AppendOutcome, WriterError> {
        self.append_audio(SampleKind::SystemAudio, sample)
    }

    pub fn append_mic_audio(&mut self, sample: SampleBuffer) -> Result<AppendOutcome, WriterError> {
        self.append_audio(SampleKind::MicAudio, sample)
    }

    fn append_video_inner(&mut self, sample: SampleBuffer) -> Result<AppendOutcome, WriterError> {
        if sample.pts < self.segment.start {
            return Ok(AppendOutcome::Dropped(DropReason::BeforeSegmentStart));
        }
        if self.session_start.is_none() {
            self.container.start_session(sample.pts)?;
            self.session_start = Some(sample.pts);
        }
        if !self.container.is_ready_for_more_data(SampleKind::Video) {
            return Ok(AppendOutcome::Dropped(DropReason::NotReady));
        }
        self.container.append(sample)?;
        Ok(AppendOutcome::Appended)
    }

    fn append_audio(
        &mut self,
        kind: SampleKind,
        mut sample: SampleBuffer,
    ) -> Result<AppendOutcome, WriterError> {
        sample.kind = kind;
        let outcome = self.append_audio_inner(sample)?;
        self.stats.record(kind, outcome);
        Ok(outcome)
    }

    fn append_audio_inner(&mut self, sample: SampleBuffer) -> Result<AppendOutcome, WriterError> {
        if !self.audio_tracks.contains(&sample.kind) {
            return Ok(AppendOutcome::Dropped(DropReason::NoTrack));
        }
        let Some(start) = self.session_start else {
            return Ok(AppendOutcome::Dropped(DropReason::SessionNotStarted));
        };
        if sample.pts < start {
            return Ok(AppendOutcome::Dropped(DropReason::BeforeSegmentStart));
        }
        if !self.container.is_ready_for_more_data(sample.kind) {
            return Ok(AppendOutcome::Dropped(DropReason::NotReady));
        }
        self.container.append(sample)?;
        Ok(AppendOutcome::Appended)
    }

    /// Seal the file on a background thread
    pub fn finalize(self) -> PendingFinalize {
        let SegmentWriter {
            segment,
            container,
            stats,
            ..
        } = self;

        tracing::debug!(
            "Finalizing segment {}: video {}/{} dropped, system {}/{}, mic {}/{}",
            segment.index,
            stats.video.dropped,
            stats.video.appended + stats.video.dropped,
            stats.system_audio.dropped,
            stats.system_audio.appended + stats.system_audio.dropped,
            stats.mic_audio.dropped,
            stats.mic_audio.appended + stats.mic_audio.dropped,
        );

        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("segment-finalize-{}", segment.index))
            .spawn(move || {
                let _ = tx.send(container.finish());
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn finalizer for segment {}: {}", segment.index, e);
        }

        PendingFinalize { segment, stats, rx }
    }
}

/// A segment whose container is being sealed
pub struct PendingFinalize {
    segment: Segment,
    stats: WriterStats,
    rx: oneshot::Receiver<Result<(), WriterError>>,
}

impl PendingFinalize {
    /// Wait until the container reports completion
    pub async fn wait(self) -> FinalizedSegment {
        let error = match self.rx.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("finalizer exited without reporting".to_string()),
        };
        if let Some(error) = &error {
            tracing::error!("Segment {} failed to finalize: {}", self.segment.index, error);
        } else {
            tracing::info!("Segment {} sealed", self.segment.index);
        }
        FinalizedSegment {
            segment: self.segment,
            stats: self.stats,
            error,
        }
    }
}

/// Outcome of sealing one segment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedSegment {
    pub segment: Segment,
    pub stats: WriterStats,
    pub error: Option<String>,
}

impl FinalizedSegment {
    pub fn is_sealed(&self) -> bool {
        self.error.is_none()
    }
}
