//! Session observers
//!
//! Callbacks a UI layer can hook to follow a recording. They fire from
//! capture threads and background tasks, so implementations must be quick
//! and must not call back into the recorder while holding their own locks.

use crate::meter::AudioLevels;
use crate::processing::PipelineReport;
use tokio::sync::broadcast;

pub trait SessionObserver: Send + Sync {
    /// Latest microphone and system audio levels, each in `[0, 1]`
    fn on_levels(&self, _mic: f32, _system: f32) {}

    /// Recording became visible to the user, or stopped being so
    fn on_recording_state_changed(&self, _is_recording: bool) {}

    /// Post-processing finished. Fires exactly once per started session.
    fn on_processing_complete(&self, _report: &PipelineReport) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Recording started or stopped
    StateChanged { recording: bool },
    /// Audio levels update
    Levels(AudioLevels),
    /// Post-processing finished
    ProcessingComplete(PipelineReport),
}

/// Observer that republishes every callback on a broadcast channel
pub struct BroadcastObserver {
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(100)
    }
}

impl SessionObserver for BroadcastObserver {
    fn on_levels(&self, mic: f32, system: f32) {
        let _ = self
            .event_tx
            .send(RecordingEvent::Levels(AudioLevels { mic, system }));
    }

    fn on_recording_state_changed(&self, is_recording: bool) {
        let _ = self.event_tx.send(RecordingEvent::StateChanged {
            recording: is_recording,
        });
    }

    fn on_processing_complete(&self, report: &PipelineReport) {
        let _ = self
            .event_tx
            .send(RecordingEvent::ProcessingComplete(report.clone()));
    }
}
