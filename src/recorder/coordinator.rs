//! Recording coordinator
//!
//! Owns the session lifecycle: starting the source, wiring its channels into
//! the writer context, and on stop running the finalize barrier followed by
//! post-processing. Stop requests may arrive from the caller or from the
//! source itself, any number of times, from any thread.

use super::context::{WriterCommand, WriterContext, WriterShutdown};
use super::observer::{NoopObserver, SessionObserver};
use super::scheduler::SegmentScheduler;
use super::state::{CaptureSession, SessionConfig, SessionState};
use super::writer::ContainerFactory;
use crate::capture::delivery::InboxDrops;
use crate::capture::{
    AudioDeviceInfo, CaptureError, DisplayInfo, SampleKind, SampleSource, SessionClock,
    SourceOutputs, StopTrigger, StreamEnd,
};
use crate::config::RecorderConfig;
use crate::meter::{AudioLevels, LevelMonitor};
use crate::processing::{
    FfmpegConcat, MediaTool, PipelinePlan, PipelineReport, PostProcessor, SegmentComposer,
};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Entry point for recording sessions.
///
/// At most one session captures at a time. A finished session may still be
/// post-processing while the next one starts, as long as the two do not share
/// a segment directory.
pub struct Recorder {
    config: Arc<RecorderConfig>,
    source: Arc<dyn SampleSource>,
    containers: Arc<dyn ContainerFactory>,
    composer: Option<Arc<dyn SegmentComposer>>,
    tool: MediaTool,
    observer: Arc<dyn SessionObserver>,
    active: Mutex<Option<SessionHandle>>,
    claimed_dirs: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        source: Arc<dyn SampleSource>,
        containers: Arc<dyn ContainerFactory>,
    ) -> Self {
        let tool = MediaTool::new(&config.tools);
        Self {
            config: Arc::new(config),
            source,
            containers,
            composer: None,
            tool,
            observer: Arc::new(NoopObserver),
            active: Mutex::new(None),
            claimed_dirs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the segment joiner; ffmpeg concat by default
    pub fn with_composer(mut self, composer: Arc<dyn SegmentComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn with_tool(mut self, tool: MediaTool) -> Self {
        self.tool = tool;
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn list_microphones(&self) -> Vec<AudioDeviceInfo> {
        self.source.list_microphones()
    }

    pub fn list_displays(&self) -> Vec<DisplayInfo> {
        self.source.list_displays()
    }

    /// The most recently started session, if any
    pub fn active_session(&self) -> Option<SessionHandle> {
        self.active.lock().clone()
    }

    /// Stop the active session. Safe to call at any time.
    pub fn stop_session(&self) {
        if let Some(handle) = self.active_session() {
            handle.stop();
        }
    }

    /// Start recording.
    ///
    /// Resolves once the source is capturing. Setup failures are returned
    /// here and never reach the completion callback.
    pub async fn start_session(&self, config: SessionConfig) -> Result<SessionHandle, CaptureError> {
        let runtime = Handle::try_current()
            .map_err(|e| CaptureError::SetupFailed(format!("no async runtime: {e}")))?;
        let session = CaptureSession::from_config(&config);
        let request = self.config.capture_request(&config);
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(self.config.inbox_capacity.max(1));
        let levels = Arc::new(LevelMonitor::new(self.config.level, self.observer.clone()));

        let handle = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|h| h.state().is_capturing()) {
                return Err(CaptureError::AlreadyRecording);
            }
            if !self.claimed_dirs.lock().insert(session.segment_dir.clone()) {
                return Err(CaptureError::SegmentDirectoryBusy(session.segment_dir.clone()));
            }

            let composer = self
                .composer
                .clone()
                .unwrap_or_else(|| Arc::new(FfmpegConcat::new(self.tool.clone())));
            let handle = SessionHandle(Arc::new(SessionInner {
                session,
                state: RwLock::new(SessionState::Starting),
                stop_requested: AtomicBool::new(false),
                announced: AtomicBool::new(false),
                accepting: Arc::new(AtomicBool::new(true)),
                inbox: inbox_tx,
                inbox_drops: Arc::new(InboxDrops::default()),
                writer_thread: Mutex::new(None),
                levels,
                runtime,
                source: self.source.clone(),
                processor: PostProcessor::new(
                    self.tool.clone(),
                    composer,
                    self.config.mixed_audio_bitrate,
                    self.config.sidecar_quality,
                ),
                observer: self.observer.clone(),
                claimed_dirs: self.claimed_dirs.clone(),
                report_tx: watch::channel(None).0,
            }));
            *active = Some(handle.clone());
            handle
        };
        let inner = &handle.0;

        tracing::info!(
            "Starting session {} -> {}",
            inner.session.id,
            inner.session.output_path.display()
        );

        if let Err(e) = prepare_directories(&inner.session) {
            inner.abort_start();
            return Err(e.into());
        }

        let outputs = SourceOutputs::new(
            inner.inbox.clone(),
            inner.accepting.clone(),
            inner.levels.clone(),
            inner.inbox_drops.clone(),
            inner.stop_trigger(),
            SessionClock::start(),
        );

        let metadata = match self.source.start(&request, outputs).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::error!("Capture setup failed: {}", e);
                inner.abort_start();
                return Err(e);
            }
        };
        tracing::info!(
            "Capturing display {} at {}x{} @ {}fps",
            metadata.display_id,
            metadata.width,
            metadata.height,
            metadata.fps
        );

        let audio_tracks = self.source.audio_tracks(&request);
        tracing::debug!("Audio tracks: {:?}", audio_tracks);
        let context = WriterContext::new(
            SegmentScheduler::new(&inner.session.segment_dir, self.config.segment_duration()),
            self.containers.clone(),
            self.config.container_template(&metadata, audio_tracks),
            inner.stop_trigger(),
        );
        match context.spawn(inbox_rx) {
            Ok(thread) => *inner.writer_thread.lock() = Some(thread),
            Err(e) => {
                tracing::error!("Failed to spawn writer thread: {}", e);
                self.source.stop().await;
                inner.abort_start();
                return Err(CaptureError::SetupFailed(format!("writer thread: {e}")));
            }
        }

        inner.finish_start();
        Ok(handle)
    }
}

/// Handle on one session; cheap to clone
#[derive(Clone)]
pub struct SessionHandle(Arc<SessionInner>);

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.0.session.id
    }

    pub fn session(&self) -> &CaptureSession {
        &self.0.session
    }

    pub fn state(&self) -> SessionState {
        *self.0.state.read()
    }

    /// Latest microphone and system levels
    pub fn levels(&self) -> AudioLevels {
        self.0.levels.levels()
    }

    /// Request a stop. Idempotent; later calls are no-ops.
    pub fn stop(&self) {
        self.0.request_stop();
    }

    /// Wait for post-processing to finish
    pub async fn wait(&self) -> PipelineReport {
        let mut rx = self.0.report_tx.subscribe();
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => report.clone(),
            Err(_) => None,
        };
        report.unwrap_or_else(|| PipelineReport::failed(self.id(), "session ended without a report"))
    }

    /// The report, if post-processing already finished
    pub fn report(&self) -> Option<PipelineReport> {
        self.0.report_tx.borrow().clone()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

struct SessionInner {
    session: CaptureSession,
    state: RwLock<SessionState>,
    /// Stop asked for while still starting
    stop_requested: AtomicBool,
    /// `on_recording_state_changed(true)` was delivered
    announced: AtomicBool,
    accepting: Arc<AtomicBool>,
    inbox: Sender<WriterCommand>,
    inbox_drops: Arc<InboxDrops>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    levels: Arc<LevelMonitor>,
    runtime: Handle,
    source: Arc<dyn SampleSource>,
    processor: PostProcessor,
    observer: Arc<dyn SessionObserver>,
    claimed_dirs: Arc<Mutex<HashSet<PathBuf>>>,
    report_tx: watch::Sender<Option<PipelineReport>>,
}

impl SessionInner {
    fn stop_trigger(self: &Arc<Self>) -> StopTrigger {
        let weak: Weak<Self> = Arc::downgrade(self);
        StopTrigger::new(move |end| {
            if let Some(inner) = weak.upgrade() {
                inner.on_stream_end(end);
            }
        })
    }

    fn on_stream_end(self: &Arc<Self>, end: StreamEnd) {
        match &end {
            StreamEnd::UserStopped => {
                tracing::info!("Session {} stream ended by the user", self.session.id)
            }
            StreamEnd::Failed(reason) => {
                tracing::error!("Session {} stream failed: {}", self.session.id, reason)
            }
        }
        self.request_stop();
    }

    fn request_stop(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            match *state {
                SessionState::Starting => {
                    tracing::debug!("Stop requested while starting, deferring");
                    self.stop_requested.store(true, Ordering::SeqCst);
                    return;
                }
                SessionState::Recording => *state = SessionState::Stopping,
                other => {
                    tracing::debug!("Stop ignored in state {:?}", other);
                    return;
                }
            }
        }
        self.begin_stop();
    }

    /// Called once the source and writer are running
    fn finish_start(self: &Arc<Self>) {
        let stop_now = {
            let mut state = self.state.write();
            if self.stop_requested.load(Ordering::SeqCst) {
                *state = SessionState::Stopping;
                true
            } else {
                *state = SessionState::Recording;
                self.announced.store(true, Ordering::SeqCst);
                false
            }
        };

        if stop_now {
            self.begin_stop();
        } else {
            tracing::info!("Session {} recording", self.session.id);
            self.observer.on_recording_state_changed(true);
        }
    }

    fn log_inbox_drops(&self) {
        let video = self.inbox_drops.get(SampleKind::Video);
        let system = self.inbox_drops.get(SampleKind::SystemAudio);
        let mic = self.inbox_drops.get(SampleKind::MicAudio);
        if video + system + mic > 0 {
            tracing::warn!(
                "Session {} writer fell behind, dropped video={} system={} mic={}",
                self.session.id,
                video,
                system,
                mic
            );
        }
    }

    fn abort_start(&self) {
        self.accepting.store(false, Ordering::Release);
        *self.state.write() = SessionState::Failed;
        if let Err(e) = std::fs::remove_dir_all(&self.session.segment_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.session.segment_dir.display(), e);
            }
        }
        self.claimed_dirs.lock().remove(&self.session.segment_dir);
    }

    fn begin_stop(self: &Arc<Self>) {
        self.accepting.store(false, Ordering::Release);
        let this = self.clone();
        self.runtime.spawn(async move { this.run_stop().await });
    }

    async fn run_stop(self: Arc<Self>) {
        let id = self.session.id;
        tracing::info!("Stopping session {}", id);

        self.source.stop().await;

        // The inbox may be full; wait for room off the async workers.
        let (reply_tx, reply_rx) = oneshot::channel();
        let inbox = self.inbox.clone();
        let sent = tokio::task::spawn_blocking(move || {
            inbox.send(WriterCommand::Shutdown(reply_tx)).is_ok()
        })
        .await
        .unwrap_or(false);
        let shutdown = if sent {
            reply_rx.await.unwrap_or_default()
        } else {
            WriterShutdown::default()
        };
        self.log_inbox_drops();
        let writer_thread = self.writer_thread.lock().take();
        if let Some(thread) = writer_thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        *self.state.write() = SessionState::Processing;
        if self.announced.load(Ordering::SeqCst) {
            self.observer.on_recording_state_changed(false);
        }

        // Every segment must be sealed before the pipeline reads it.
        let mut finalized = Vec::with_capacity(shutdown.pending.len());
        for pending in shutdown.pending {
            finalized.push(pending.wait().await);
        }

        let plan = PipelinePlan {
            session_id: id,
            segments: finalized,
            timeline: shutdown.segments,
            output_path: self.session.output_path.clone(),
            segment_dir: self.session.segment_dir.clone(),
            sidecar_path: self.session.sidecar_path.clone(),
        };
        let processor = self.processor.clone();
        let report = match tokio::task::spawn_blocking(move || processor.run(plan)).await {
            Ok(report) => report,
            Err(e) => PipelineReport::failed(id, format!("post-processing task failed: {e}")),
        };

        *self.state.write() = if report.outcome.is_failure() {
            SessionState::Failed
        } else {
            SessionState::Done
        };
        self.claimed_dirs.lock().remove(&self.session.segment_dir);
        self.levels.reset();

        self.observer.on_processing_complete(&report);
        self.report_tx.send_replace(Some(report));
    }
}

/// Create the output directory and a fresh segment directory
fn prepare_directories(session: &CaptureSession) -> std::io::Result<()> {
    if let Some(parent) = session.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    clear_dir(&session.segment_dir)?;
    std::fs::create_dir_all(&session.segment_dir)
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            tracing::warn!("Removed leftover segments in {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
