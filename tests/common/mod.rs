//! Common test utilities for recorder integration tests
//!
//! Scripted sources and in-memory containers so whole sessions can run
//! without a display, audio hardware or ffmpeg.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use screentape::capture::{
    CaptureError, CaptureRequest, Delivery, DisplayMetadata, SampleBuffer, SampleKind,
    SampleSource, SourceOutputs, StreamEnd,
};
use screentape::processing::{ConsolidateError, MediaTool, SegmentComposer, ToolConfig};
use screentape::recorder::{ContainerFactory, ContainerSpec, ContainerWriter, WriterError};
use screentape::{PipelineReport, SessionObserver};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

pub const TEST_DISPLAY: DisplayMetadata = DisplayMetadata {
    display_id: 7,
    width: 64,
    height: 36,
    fps: 30,
};

/// Video frames at `fps` for `secs`, plus 100ms audio buffers per track
pub fn av_script(secs: u64, fps: u64, audio: &[SampleKind]) -> Vec<SampleBuffer> {
    let mut script = Vec::new();
    for frame in 0..secs * fps {
        let pts = Duration::from_nanos(frame * 1_000_000_000 / fps);
        script.push(SampleBuffer::new(SampleKind::Video, pts, vec![0u8; 16]));
    }
    for &kind in audio {
        for chunk in 0..secs * 10 {
            let pts = Duration::from_millis(chunk * 100);
            script.push(SampleBuffer::from_f32(kind, pts, &[0.25, -0.25, 0.25, -0.25]));
        }
    }
    // Stable: a video frame sorts ahead of audio with the same timestamp.
    script.sort_by_key(|sample| sample.pts);
    script
}

/// How a scripted source paces its samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Wait for inbox room, so every sample arrives
    Lossless,
    /// Send each sample once its pts has elapsed and never retry
    RealTime,
}

/// Source that replays a fixed script.
///
/// Whatever fits in the inbox is delivered inside `start`; the rest follows
/// from a delivery thread. `delivered` resolves once the script is through.
pub struct ScriptedSource {
    script: Arc<Vec<SampleBuffer>>,
    pacing: Pacing,
    start_error: Mutex<Option<CaptureError>>,
    /// When set, `start` waits for a permit before delivering
    gate: Option<Arc<Notify>>,
    pub entered: Arc<Notify>,
    outputs: Mutex<Option<SourceOutputs>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    done: Arc<watch::Sender<bool>>,
    /// Samples the inbox refused in real-time pacing
    pub dropped: Arc<AtomicUsize>,
    /// When the real-time script started, pts zero
    pub started_at: Arc<Mutex<Option<Instant>>>,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: Vec<SampleBuffer>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            script: Arc::new(script),
            pacing: Pacing::Lossless,
            start_error: Mutex::new(None),
            gate: None,
            entered: Arc::new(Notify::new()),
            outputs: Mutex::new(None),
            delivery: Mutex::new(None),
            done: Arc::new(done),
            dropped: Arc::new(AtomicUsize::new(0)),
            started_at: Arc::new(Mutex::new(None)),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `start` with `error`
    pub fn failing_once(self, error: CaptureError) -> Self {
        *self.start_error.lock() = Some(error);
        self
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn real_time(mut self) -> Self {
        self.pacing = Pacing::RealTime;
        self
    }

    /// End the stream as the platform would
    pub fn end_stream(&self, end: StreamEnd) {
        let stop = self.outputs.lock().as_ref().map(|outputs| outputs.stop.clone());
        if let Some(stop) = stop {
            stop.fire(end);
        }
    }

    /// Wait until the whole script went out (or the session closed)
    pub async fn delivered(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Send without waiting until the inbox refuses; returns where it stopped
fn deliver_what_fits(script: &[SampleBuffer], outputs: &SourceOutputs) -> usize {
    for (at, sample) in script.iter().enumerate() {
        match outputs.channel(sample.kind).send(sample.pts, sample.data.clone()) {
            Delivery::Queued => {}
            Delivery::Dropped | Delivery::Closed => return at,
        }
    }
    script.len()
}

fn deliver_lossless(script: &[SampleBuffer], outputs: &SourceOutputs) {
    for sample in script {
        loop {
            match outputs.channel(sample.kind).send(sample.pts, sample.data.clone()) {
                Delivery::Queued => break,
                Delivery::Dropped => std::thread::sleep(Duration::from_micros(200)),
                Delivery::Closed => return,
            }
        }
    }
}

fn deliver_real_time(script: &[SampleBuffer], outputs: &SourceOutputs, dropped: &AtomicUsize) {
    let started = Instant::now();
    for sample in script {
        if let Some(wait) = (started + sample.pts).checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        match outputs.channel(sample.kind).send(sample.pts, sample.data.clone()) {
            Delivery::Queued => {}
            Delivery::Dropped => {
                dropped.fetch_add(1, Ordering::SeqCst);
            }
            Delivery::Closed => return,
        }
    }
}

#[async_trait]
impl SampleSource for ScriptedSource {
    async fn start(
        &self,
        _request: &CaptureRequest,
        outputs: SourceOutputs,
    ) -> Result<DisplayMetadata, CaptureError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(error) = self.start_error.lock().take() {
            return Err(error);
        }
        self.done.send_replace(false);
        *self.outputs.lock() = Some(outputs.clone());

        let script = self.script.clone();
        let pacing = self.pacing;
        let done = self.done.clone();
        let dropped = self.dropped.clone();
        let started_at = self.started_at.clone();
        let sent = match pacing {
            Pacing::Lossless => deliver_what_fits(&script, &outputs),
            Pacing::RealTime => 0,
        };
        let delivery = std::thread::Builder::new()
            .name("scripted-source".into())
            .spawn(move || {
                match pacing {
                    Pacing::Lossless => deliver_lossless(&script[sent..], &outputs),
                    Pacing::RealTime => {
                        *started_at.lock() = Some(Instant::now());
                        deliver_real_time(&script, &outputs, &dropped);
                    }
                }
                done.send_replace(true);
            })
            .map_err(|e| CaptureError::SetupFailed(e.to_string()))?;
        *self.delivery.lock() = Some(delivery);
        Ok(TEST_DISPLAY)
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.outputs.lock().take();
        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            let _ = tokio::task::spawn_blocking(move || delivery.join()).await;
        }
    }
}

/// What one in-memory container saw
#[derive(Debug, Clone, Default)]
pub struct ContainerLog {
    pub path: PathBuf,
    pub video: usize,
    pub system: usize,
    pub mic: usize,
    pub body: Vec<u8>,
}

/// Containers that count samples and write a small summary file
#[derive(Default)]
pub struct MemoryContainerFactory {
    pub ready: Arc<AtomicBool>,
    pub finish_delay: Option<Duration>,
    /// Stalls the first `create`, as a slow disk or encoder start would
    pub create_delay: Mutex<Option<Duration>>,
    pub sealed: Arc<Mutex<Vec<ContainerLog>>>,
    pub specs: Arc<Mutex<Vec<ContainerSpec>>>,
    /// Video pts and when the container took it
    pub video_appends: Arc<Mutex<Vec<(Duration, Instant)>>>,
}

impl MemoryContainerFactory {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        }
    }

    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = Some(delay);
        self
    }

    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.lock() = Some(delay);
        self
    }

    pub fn sealed(&self) -> Vec<ContainerLog> {
        self.sealed.lock().clone()
    }
}

impl ContainerFactory for MemoryContainerFactory {
    fn create(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerWriter>, WriterError> {
        self.specs.lock().push(spec.clone());
        let delay = self.create_delay.lock().take();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(Box::new(MemoryContainer {
            log: ContainerLog {
                path: spec.path.clone(),
                ..Default::default()
            },
            ready: self.ready.clone(),
            finish_delay: self.finish_delay,
            sealed: self.sealed.clone(),
            video_appends: self.video_appends.clone(),
        }))
    }
}

struct MemoryContainer {
    log: ContainerLog,
    ready: Arc<AtomicBool>,
    finish_delay: Option<Duration>,
    sealed: Arc<Mutex<Vec<ContainerLog>>>,
    video_appends: Arc<Mutex<Vec<(Duration, Instant)>>>,
}

impl ContainerWriter for MemoryContainer {
    fn start_session(&mut self, _at: Duration) -> Result<(), WriterError> {
        Ok(())
    }

    fn is_ready_for_more_data(&self, _track: SampleKind) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn append(&mut self, sample: SampleBuffer) -> Result<(), WriterError> {
        match sample.kind {
            SampleKind::Video => {
                self.log.video += 1;
                self.video_appends.lock().push((sample.pts, Instant::now()));
            }
            SampleKind::SystemAudio => self.log.system += 1,
            SampleKind::MicAudio => self.log.mic += 1,
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), WriterError> {
        if let Some(delay) = self.finish_delay {
            std::thread::sleep(delay);
        }
        let name = self
            .log
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.log.body = format!(
            "{} video={} system={} mic={}\n",
            name, self.log.video, self.log.system, self.log.mic
        )
        .into_bytes();
        std::fs::write(&self.log.path, &self.log.body)?;
        self.sealed.lock().push(self.log.clone());
        Ok(())
    }
}

/// Joins segments by byte concatenation
#[derive(Default)]
pub struct ByteConcatComposer {
    pub calls: Mutex<Vec<Vec<PathBuf>>>,
}

impl SegmentComposer for ByteConcatComposer {
    fn compose(&self, segments: &[PathBuf], output: &Path) -> Result<(), ConsolidateError> {
        self.calls.lock().push(segments.to_vec());
        let mut joined = Vec::new();
        for path in segments {
            joined.extend(std::fs::read(path)?);
        }
        std::fs::write(output, joined)?;
        Ok(())
    }
}

/// Observer recording every callback
#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<bool>>,
    pub levels: Mutex<Vec<(f32, f32)>>,
    pub completions: Mutex<Vec<PipelineReport>>,
}

impl SessionObserver for RecordingObserver {
    fn on_levels(&self, mic: f32, system: f32) {
        self.levels.lock().push((mic, system));
    }

    fn on_recording_state_changed(&self, is_recording: bool) {
        self.states.lock().push(is_recording);
    }

    fn on_processing_complete(&self, report: &PipelineReport) {
        self.completions.lock().push(report.clone());
    }
}

/// Media tool pointing at binaries that do not exist
pub fn unavailable_tool() -> MediaTool {
    MediaTool::new(&ToolConfig {
        ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
        ffprobe: PathBuf::from("/nonexistent/ffprobe"),
    })
}
