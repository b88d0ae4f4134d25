//! Delivery channels from capture threads into a session
//!
//! Each channel is a cheap clonable handle. Sending never blocks: samples go
//! into the writer context's bounded inbox, or are dropped and counted when
//! it is full. Audio is metered on the way.

use super::traits::{SampleBuffer, SampleKind, SessionClock, StreamEnd};
use crate::meter::LevelMonitor;
use crate::recorder::context::WriterCommand;
use crossbeam_channel::{Sender, TrySendError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback a source fires when its platform stream ends on its own
#[derive(Clone)]
pub struct StopTrigger {
    inner: Arc<dyn Fn(StreamEnd) + Send + Sync>,
}

impl StopTrigger {
    pub fn new(callback: impl Fn(StreamEnd) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(callback),
        }
    }

    pub fn fire(&self, end: StreamEnd) {
        (self.inner)(end)
    }
}

impl fmt::Debug for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StopTrigger")
    }
}

/// What happened to a sample handed to a [`DeliveryChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The writer inbox was full
    Dropped,
    /// The session no longer takes samples
    Closed,
}

/// Samples dropped at a full inbox, per kind
#[derive(Debug, Default)]
pub(crate) struct InboxDrops {
    video: AtomicU64,
    system_audio: AtomicU64,
    mic_audio: AtomicU64,
}

impl InboxDrops {
    fn counter(&self, kind: SampleKind) -> &AtomicU64 {
        match kind {
            SampleKind::Video => &self.video,
            SampleKind::SystemAudio => &self.system_audio,
            SampleKind::MicAudio => &self.mic_audio,
        }
    }

    pub(crate) fn get(&self, kind: SampleKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }
}

/// Producer handle for one sample channel
#[derive(Clone)]
pub struct DeliveryChannel {
    kind: SampleKind,
    inbox: Sender<WriterCommand>,
    accepting: Arc<AtomicBool>,
    levels: Option<Arc<LevelMonitor>>,
    drops: Arc<InboxDrops>,
}

impl DeliveryChannel {
    pub(crate) fn new(
        kind: SampleKind,
        inbox: Sender<WriterCommand>,
        accepting: Arc<AtomicBool>,
        levels: Option<Arc<LevelMonitor>>,
        drops: Arc<InboxDrops>,
    ) -> Self {
        Self {
            kind,
            inbox,
            accepting,
            levels,
            drops,
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    /// Whether the session still takes samples
    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Hand a sample to the session without waiting.
    ///
    /// A full inbox drops the sample; a stalled writer never makes the
    /// capture thread wait or the backlog grow.
    pub fn send(&self, pts: Duration, data: Vec<u8>) -> Delivery {
        if !self.is_open() {
            return Delivery::Closed;
        }
        if let Some(levels) = &self.levels {
            levels.observe(self.kind, &data);
        }
        match self
            .inbox
            .try_send(WriterCommand::Sample(SampleBuffer::new(self.kind, pts, data)))
        {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.drops.counter(self.kind).fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }
}

impl fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Everything a source needs to feed one session
#[derive(Debug, Clone)]
pub struct SourceOutputs {
    pub video: DeliveryChannel,
    pub system_audio: DeliveryChannel,
    pub mic_audio: DeliveryChannel,
    pub stop: StopTrigger,
    pub clock: SessionClock,
}

impl SourceOutputs {
    pub(crate) fn new(
        inbox: Sender<WriterCommand>,
        accepting: Arc<AtomicBool>,
        levels: Arc<LevelMonitor>,
        drops: Arc<InboxDrops>,
        stop: StopTrigger,
        clock: SessionClock,
    ) -> Self {
        Self {
            video: DeliveryChannel::new(
                SampleKind::Video,
                inbox.clone(),
                accepting.clone(),
                None,
                drops.clone(),
            ),
            system_audio: DeliveryChannel::new(
                SampleKind::SystemAudio,
                inbox.clone(),
                accepting.clone(),
                Some(levels.clone()),
                drops.clone(),
            ),
            mic_audio: DeliveryChannel::new(
                SampleKind::MicAudio,
                inbox,
                accepting,
                Some(levels),
                drops,
            ),
            stop,
            clock,
        }
    }

    pub fn channel(&self, kind: SampleKind) -> &DeliveryChannel {
        match kind {
            SampleKind::Video => &self.video,
            SampleKind::SystemAudio => &self.system_audio,
            SampleKind::MicAudio => &self.mic_audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::LevelMeterConfig;
    use crate::recorder::NoopObserver;
    use parking_lot::Mutex;

    struct Fixture {
        outputs: SourceOutputs,
        rx: crossbeam_channel::Receiver<WriterCommand>,
        accepting: Arc<AtomicBool>,
        drops: Arc<InboxDrops>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let accepting = Arc::new(AtomicBool::new(true));
        let drops = Arc::new(InboxDrops::default());
        let levels = Arc::new(LevelMonitor::new(
            LevelMeterConfig::default(),
            Arc::new(NoopObserver),
        ));
        let outputs = SourceOutputs::new(
            tx,
            accepting.clone(),
            levels,
            drops.clone(),
            StopTrigger::new(|_| {}),
            SessionClock::start(),
        );
        Fixture {
            outputs,
            rx,
            accepting,
            drops,
        }
    }

    #[test]
    fn test_send_tags_samples_with_channel_kind() {
        let Fixture { outputs, rx, .. } = fixture(4);
        assert_eq!(
            outputs.mic_audio.send(Duration::from_millis(5), vec![0; 8]),
            Delivery::Queued
        );

        match rx.try_recv() {
            Ok(WriterCommand::Sample(sample)) => {
                assert_eq!(sample.kind, SampleKind::MicAudio);
                assert_eq!(sample.pts, Duration::from_millis(5));
            }
            _ => panic!("expected a sample"),
        }
    }

    #[test]
    fn test_samples_after_close_are_discarded() {
        let Fixture {
            outputs,
            rx,
            accepting,
            ..
        } = fixture(4);
        accepting.store(false, Ordering::Release);

        assert_eq!(outputs.video.send(Duration::ZERO, vec![0; 4]), Delivery::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_inbox_drops_instead_of_queueing() {
        let Fixture {
            outputs, rx, drops, ..
        } = fixture(3);

        let results: Vec<Delivery> = (0..10u64)
            .map(|k| outputs.video.send(Duration::from_millis(k * 33), vec![0; 16]))
            .collect();

        assert_eq!(&results[..3], &[Delivery::Queued; 3]);
        assert!(results[3..].iter().all(|d| *d == Delivery::Dropped));
        assert_eq!(rx.len(), 3);
        assert_eq!(drops.get(SampleKind::Video), 7);
        assert_eq!(drops.get(SampleKind::MicAudio), 0);

        // Room again once the writer catches up.
        rx.try_recv().unwrap();
        assert_eq!(
            outputs.system_audio.send(Duration::from_millis(400), vec![0; 8]),
            Delivery::Queued
        );
    }

    #[test]
    fn test_disconnected_inbox_reports_closed() {
        let Fixture { outputs, rx, .. } = fixture(2);
        drop(rx);
        assert_eq!(outputs.video.send(Duration::ZERO, vec![0; 4]), Delivery::Closed);
    }

    #[test]
    fn test_stop_trigger_forwards_reason() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let trigger = StopTrigger::new(move |end| sink.lock().push(end));

        trigger.fire(StreamEnd::UserStopped);
        trigger.clone().fire(StreamEnd::Failed("gone".into()));

        assert_eq!(
            *seen.lock(),
            vec![StreamEnd::UserStopped, StreamEnd::Failed("gone".into())]
        );
    }
}
