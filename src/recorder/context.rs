//! Writer context
//!
//! A dedicated thread that owns the segment scheduler and the open segment
//! writer. All three delivery channels funnel into its inbox, so segment
//! state is only ever touched from this one thread.

use super::scheduler::{Segment, SegmentDecision, SegmentScheduler};
use super::writer::{ContainerFactory, ContainerSpec, PendingFinalize, SegmentWriter, WriterError};
use crate::capture::{SampleBuffer, SampleKind, StopTrigger, StreamEnd};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

pub(crate) enum WriterCommand {
    Sample(SampleBuffer),
    /// Close the open segment and hand back everything still being sealed
    Shutdown(oneshot::Sender<WriterShutdown>),
}

/// What the writer context leaves behind when it stops
#[derive(Default)]
pub(crate) struct WriterShutdown {
    /// Closed segments, in order, with their time ranges
    pub segments: Vec<Segment>,
    /// Segments still being sealed
    pub pending: Vec<PendingFinalize>,
}

pub(crate) struct WriterContext {
    scheduler: SegmentScheduler,
    factory: Arc<dyn ContainerFactory>,
    template: ContainerSpec,
    current: Option<SegmentWriter>,
    pending: Vec<PendingFinalize>,
    stop: StopTrigger,
    failed: bool,
}

impl WriterContext {
    pub(crate) fn new(
        scheduler: SegmentScheduler,
        factory: Arc<dyn ContainerFactory>,
        template: ContainerSpec,
        stop: StopTrigger,
    ) -> Self {
        Self {
            scheduler,
            factory,
            template,
            current: None,
            pending: Vec::new(),
            stop,
            failed: false,
        }
    }

    pub(crate) fn spawn(self, inbox: Receiver<WriterCommand>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("segment-writer".into())
            .spawn(move || self.run(inbox))
    }

    fn run(mut self, inbox: Receiver<WriterCommand>) {
        while let Ok(command) = inbox.recv() {
            match command {
                WriterCommand::Sample(sample) => self.handle_sample(sample),
                WriterCommand::Shutdown(reply) => {
                    let _ = reply.send(self.shutdown());
                    return;
                }
            }
        }
        // Every sender is gone without a shutdown request; seal what is open.
        let _ = self.shutdown();
    }

    pub(crate) fn handle_sample(&mut self, sample: SampleBuffer) {
        if self.failed {
            return;
        }
        let result = match sample.kind {
            SampleKind::Video => self.handle_video(sample),
            SampleKind::SystemAudio => match self.current.as_mut() {
                Some(writer) => writer.append_system_audio(sample).map(|_| ()),
                None => Ok(()),
            },
            SampleKind::MicAudio => match self.current.as_mut() {
                Some(writer) => writer.append_mic_audio(sample).map(|_| ()),
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn handle_video(&mut self, sample: SampleBuffer) -> Result<(), WriterError> {
        match self.scheduler.on_video_frame(sample.pts) {
            SegmentDecision::Open(segment) => self.open_segment(segment)?,
            SegmentDecision::Rotate { closed, opened } => {
                if let Some(writer) = self.current.take() {
                    tracing::info!(
                        "Segment {} reached {:.1}s, rotating",
                        closed.index,
                        closed.span().unwrap_or_default().as_secs_f64()
                    );
                    self.pending.push(writer.finalize());
                }
                self.open_segment(opened)?;
            }
            SegmentDecision::Continue => {}
        }

        if let Some(writer) = self.current.as_mut() {
            writer.append_video(sample)?;
        }
        Ok(())
    }

    fn open_segment(&mut self, segment: Segment) -> Result<(), WriterError> {
        let spec = self.template.for_path(segment.path.clone());
        match SegmentWriter::open(self.factory.as_ref(), segment, spec) {
            Ok(writer) => {
                self.current = Some(writer);
                Ok(())
            }
            Err(e) => {
                self.scheduler.abandon_current();
                Err(e)
            }
        }
    }

    /// Stop accepting samples and ask the session to stop
    fn fail(&mut self, error: WriterError) {
        tracing::error!("Segment writer failed: {}", error);
        self.failed = true;
        self.close_current();
        self.stop.fire(StreamEnd::Failed(format!("segment writer: {error}")));
    }

    fn close_current(&mut self) {
        if let Some(writer) = self.current.take() {
            self.scheduler.close();
            self.pending.push(writer.finalize());
        }
    }

    pub(crate) fn shutdown(&mut self) -> WriterShutdown {
        self.close_current();
        tracing::debug!(
            "Writer context shutting down: {} segment(s), {} still sealing",
            self.scheduler.segments().len(),
            self.pending.len()
        );
        WriterShutdown {
            segments: self.scheduler.segments().to_vec(),
            pending: std::mem::take(&mut self.pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::writer::ContainerWriter;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingContainer {
        path: PathBuf,
    }

    impl ContainerWriter for CountingContainer {
        fn start_session(&mut self, _at: Duration) -> Result<(), WriterError> {
            Ok(())
        }

        fn is_ready_for_more_data(&self, _track: SampleKind) -> bool {
            true
        }

        fn append(&mut self, _sample: SampleBuffer) -> Result<(), WriterError> {
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<(), WriterError> {
            std::fs::write(&self.path, b"segment")?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Factory {
        created: AtomicUsize,
        refuse: AtomicBool,
    }

    impl ContainerFactory for Factory {
        fn create(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerWriter>, WriterError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(WriterError::Encoder("refused".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingContainer {
                path: spec.path.clone(),
            }))
        }
    }

    fn template() -> ContainerSpec {
        ContainerSpec {
            path: PathBuf::new(),
            width: 4,
            height: 2,
            fps: 10,
            video_bitrate: 1_000_000,
            audio_tracks: vec![SampleKind::SystemAudio],
            sample_rate: 48_000,
            channels: 2,
            audio_bitrate: 128_000,
        }
    }

    fn context(dir: &std::path::Path, factory: Arc<Factory>, stops: Arc<Mutex<Vec<StreamEnd>>>) -> WriterContext {
        WriterContext::new(
            SegmentScheduler::new(dir, Duration::from_secs(2)),
            factory,
            template(),
            StopTrigger::new(move |end| stops.lock().push(end)),
        )
    }

    fn video(ms: u64) -> SampleBuffer {
        SampleBuffer::new(SampleKind::Video, Duration::from_millis(ms), vec![0; 32])
    }

    #[tokio::test]
    async fn test_rotation_seals_previous_segment() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(Factory::default());
        let stops = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(dir.path(), factory.clone(), stops.clone());

        for k in 0..50 {
            ctx.handle_sample(video(k * 100));
        }
        let shutdown = ctx.shutdown();

        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert_eq!(shutdown.segments.len(), 3);
        assert_eq!(shutdown.pending.len(), 3);
        for pending in shutdown.pending {
            let finalized = pending.wait().await;
            assert!(finalized.is_sealed());
            assert!(finalized.segment.path.exists());
        }
        assert!(stops.lock().is_empty());
    }

    #[test]
    fn test_open_failure_fires_stop_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(Factory::default());
        factory.refuse.store(true, Ordering::SeqCst);
        let stops = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = context(dir.path(), factory, stops.clone());

        ctx.handle_sample(video(0));
        ctx.handle_sample(video(100));

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert!(!stops[0].is_benign());
        assert!(ctx.shutdown().segments.is_empty());
    }

    #[test]
    fn test_audio_without_open_segment_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(Factory::default());
        let mut ctx = context(dir.path(), factory.clone(), Arc::new(Mutex::new(Vec::new())));

        ctx.handle_sample(SampleBuffer::new(SampleKind::SystemAudio, Duration::ZERO, vec![0; 8]));

        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(ctx.shutdown().pending.is_empty());
    }
}
