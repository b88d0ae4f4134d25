//! Integration tests for the recording session lifecycle.
//!
//! Sessions run end to end against scripted sources and in-memory
//! containers: start, rotate, stop, finalize, consolidate, clean up.

mod common;

use common::{
    av_script, unavailable_tool, ByteConcatComposer, MemoryContainerFactory, RecordingObserver,
    ScriptedSource,
};
use screentape::capture::{CaptureError, SampleKind, StreamEnd};
use screentape::{PipelineOutcome, Recorder, RecorderConfig, SessionConfig, SessionState};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct Harness {
    recorder: Arc<Recorder>,
    source: Arc<ScriptedSource>,
    containers: Arc<MemoryContainerFactory>,
    composer: Arc<ByteConcatComposer>,
    observer: Arc<RecordingObserver>,
}

fn harness(source: ScriptedSource, containers: MemoryContainerFactory) -> Harness {
    harness_with(RecorderConfig::default(), source, containers)
}

fn harness_with(
    config: RecorderConfig,
    source: ScriptedSource,
    containers: MemoryContainerFactory,
) -> Harness {
    let source = Arc::new(source);
    let containers = Arc::new(containers);
    let composer = Arc::new(ByteConcatComposer::default());
    let observer = Arc::new(RecordingObserver::default());
    let recorder = Recorder::new(config, source.clone(), containers.clone())
        .with_tool(unavailable_tool())
        .with_composer(composer.clone())
        .with_observer(observer.clone());
    Harness {
        recorder: Arc::new(recorder),
        source,
        containers,
        composer,
        observer,
    }
}

fn session(dir: &Path) -> SessionConfig {
    SessionConfig::new(dir).with_file_stem("demo")
}

#[tokio::test]
async fn test_single_segment_is_renamed_into_place() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(
            5,
            30,
            &[SampleKind::SystemAudio, SampleKind::MicAudio],
        )),
        MemoryContainerFactory::new(),
    );

    let handle = h
        .recorder
        .start_session(session(dir.path()).with_microphone("mic-1"))
        .await
        .unwrap();
    assert_eq!(handle.state(), SessionState::Recording);
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.segment_count, 1);
    assert!(!report.audio_mixed, "no tool, tracks stay as recorded");

    let sealed = h.containers.sealed();
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].video, 150);
    assert!(sealed[0].system > 0);
    assert!(sealed[0].mic > 0);

    let output = dir.path().join("demo.mp4");
    assert_eq!(std::fs::read(&output).unwrap(), sealed[0].body);
    assert!(!dir.path().join("segments").exists());
    assert!(h.composer.calls.lock().is_empty());

    let specs = h.containers.specs.lock();
    assert_eq!(
        specs[0].audio_tracks,
        vec![SampleKind::SystemAudio, SampleKind::MicAudio]
    );

    assert_eq!(*h.observer.states.lock(), vec![true, false]);
    assert_eq!(h.observer.completions.lock().len(), 1);
    assert!(!h.observer.levels.lock().is_empty());
    assert_eq!(handle.state(), SessionState::Done);
}

#[tokio::test]
async fn test_long_session_rotates_into_ordered_segments() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(250, 30, &[])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(report.segment_count, 3);

    let starts: Vec<Duration> = report.segments.iter().map(|s| s.start).collect();
    assert_eq!(
        starts,
        vec![
            Duration::ZERO,
            Duration::from_secs(120),
            Duration::from_secs(240)
        ]
    );
    assert_eq!(report.segments[0].span(), Some(Duration::from_secs(120)));
    let indexes: Vec<u32> = report.segments.iter().map(|s| s.index).collect();
    assert_eq!(indexes, vec![1, 2, 3]);

    let calls = h.composer.calls.lock();
    assert_eq!(calls.len(), 1);
    let names: Vec<String> = calls[0]
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["segment_0001.mp4", "segment_0002.mp4", "segment_0003.mp4"]
    );

    let mut sealed = h.containers.sealed();
    sealed.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(sealed.iter().map(|c| c.video).sum::<usize>(), 7500);
    let expected: Vec<u8> = sealed.iter().flat_map(|c| c.body.clone()).collect();
    assert_eq!(std::fs::read(dir.path().join("demo.mp4")).unwrap(), expected);
    assert!(!dir.path().join("segments").exists());
}

#[tokio::test]
async fn test_sidecar_without_tool_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(2, 30, &[SampleKind::SystemAudio])),
        MemoryContainerFactory::new(),
    );

    let handle = h
        .recorder
        .start_session(session(dir.path()).with_sidecar_audio(true))
        .await
        .unwrap();
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Degraded);
    assert!(dir.path().join("demo.mp4").exists());
    assert!(report.sidecar.is_none());
    assert!(!dir.path().join("demo.mp3").exists());
    assert!(report.warnings.iter().any(|w| w.contains("MP3")));
    assert_eq!(handle.state(), SessionState::Done);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(1, 30, &[])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    handle.stop();
    handle.stop();
    h.recorder.stop_session();
    let first = handle.wait().await;

    handle.stop();
    let second = handle.wait().await;

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(first.outcome, PipelineOutcome::Completed);
    assert_eq!(h.source.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.observer.completions.lock().len(), 1);
    assert_eq!(*h.observer.states.lock(), vec![true, false]);
}

#[tokio::test]
async fn test_second_start_while_recording_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(1, 30, &[])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    let second = h.recorder.start_session(session(other.path())).await;
    assert!(matches!(second, Err(CaptureError::AlreadyRecording)));

    handle.stop();
    assert_eq!(handle.wait().await.outcome, PipelineOutcome::Completed);
    assert_eq!(h.source.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_during_start_completes_once() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let h = harness(
        ScriptedSource::new(av_script(1, 30, &[])).gated(gate.clone()),
        MemoryContainerFactory::new(),
    );

    let recorder = h.recorder.clone();
    let config = session(dir.path());
    let starting = tokio::spawn(async move { recorder.start_session(config).await });

    h.source.entered.notified().await;
    h.recorder.stop_session();
    assert_eq!(
        h.recorder.active_session().map(|s| s.state()),
        Some(SessionState::Starting)
    );
    gate.notify_one();

    let handle = starting.await.unwrap().unwrap();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert!(h.observer.states.lock().is_empty());
    assert_eq!(h.observer.completions.lock().len(), 1);
    assert_eq!(h.source.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_ended_by_user_finishes_normally() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(3, 30, &[SampleKind::SystemAudio])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    h.source.end_stream(StreamEnd::UserStopped);
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert!(report.warnings.is_empty());
    assert!(dir.path().join("demo.mp4").exists());
    assert_eq!(*h.observer.states.lock(), vec![true, false]);

    // A stop after the stream already ended changes nothing.
    handle.stop();
    assert_eq!(h.observer.completions.lock().len(), 1);
}

#[tokio::test]
async fn test_stream_failure_keeps_captured_media() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(3, 30, &[])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    h.source
        .end_stream(StreamEnd::Failed("display disconnected".to_string()));
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert!(dir.path().join("demo.mp4").exists());
}

#[tokio::test]
async fn test_setup_failure_is_returned_and_recorder_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(1, 30, &[]))
            .failing_once(CaptureError::PermissionDenied("not granted".into())),
        MemoryContainerFactory::new(),
    );

    let failed = h.recorder.start_session(session(dir.path())).await;
    assert!(matches!(failed, Err(CaptureError::PermissionDenied(_))));
    assert!(!dir.path().join("segments").exists());
    assert!(h.observer.completions.lock().is_empty());
    assert!(h.observer.states.lock().is_empty());
    assert_eq!(
        h.recorder.active_session().map(|s| s.state()),
        Some(SessionState::Failed)
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    handle.stop();
    assert_eq!(handle.wait().await.outcome, PipelineOutcome::Completed);
    assert_eq!(h.observer.completions.lock().len(), 1);
}

#[tokio::test]
async fn test_segment_directory_is_claimed_until_processing_ends() {
    let dir = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(1, 30, &[])),
        MemoryContainerFactory::new().with_finish_delay(Duration::from_millis(500)),
    );

    let first = h.recorder.start_session(session(dir.path())).await.unwrap();
    first.stop();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while first.state() != SessionState::Processing {
        assert!(tokio::time::Instant::now() < deadline, "never reached processing");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let busy = h.recorder.start_session(session(dir.path())).await;
    assert!(matches!(busy, Err(CaptureError::SegmentDirectoryBusy(_))));

    let second = h.recorder.start_session(session(other.path())).await.unwrap();
    second.stop();

    assert_eq!(first.wait().await.outcome, PipelineOutcome::Completed);
    assert_eq!(second.wait().await.outcome, PipelineOutcome::Completed);
    assert_eq!(h.observer.completions.lock().len(), 2);
}

#[tokio::test]
async fn test_stop_with_no_frames_reports_no_recording() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(ScriptedSource::new(Vec::new()), MemoryContainerFactory::new());

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    handle.stop();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::NoRecording);
    assert!(report.output.is_none());
    assert!(!dir.path().join("demo.mp4").exists());
    assert!(!dir.path().join("segments").exists());
    assert_eq!(handle.state(), SessionState::Done);
}

#[tokio::test]
async fn test_back_pressure_drops_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let containers = MemoryContainerFactory::new();
    containers.ready.store(false, Ordering::SeqCst);
    let h = harness(ScriptedSource::new(av_script(1, 30, &[])), containers);

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;

    // The segment exists but every frame was refused.
    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert_eq!(h.containers.sealed()[0].video, 0);
}

#[tokio::test]
async fn test_session_without_microphone_declares_system_track_only() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(av_script(2, 30, &[SampleKind::SystemAudio])),
        MemoryContainerFactory::new(),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;

    assert_eq!(report.outcome, PipelineOutcome::Completed);
    assert!(!report.audio_mixed);
    let specs = h.containers.specs.lock();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].audio_tracks, vec![SampleKind::SystemAudio]);

    let sealed = h.containers.sealed();
    assert_eq!(sealed[0].video, 60);
    assert_eq!(sealed[0].system, 20);
    assert_eq!(sealed[0].mic, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_writer_drops_instead_of_lagging() {
    const CAPACITY: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        inbox_capacity: CAPACITY,
        ..RecorderConfig::default()
    };
    // 100 frames per second for two seconds; the first segment takes a
    // full second to open.
    let h = harness_with(
        config,
        ScriptedSource::new(av_script(2, 100, &[])).real_time(),
        MemoryContainerFactory::new().with_create_delay(Duration::from_secs(1)),
    );

    let handle = h.recorder.start_session(session(dir.path())).await.unwrap();
    h.source.delivered().await;
    handle.stop();
    let report = handle.wait().await;
    assert_eq!(report.outcome, PipelineOutcome::Completed);

    assert!(h.source.dropped.load(Ordering::SeqCst) > 0);

    let appends = h.containers.video_appends.lock().clone();
    let started = (*h.source.started_at.lock()).expect("real-time delivery started");

    // Only what fit in the inbox survives the stall.
    let during_stall = appends
        .iter()
        .filter(|(pts, _)| *pts < Duration::from_millis(900))
        .count();
    assert!(
        during_stall <= CAPACITY + 1,
        "{during_stall} frames from the stall were kept"
    );

    // Once the writer is back, new frames are not stuck behind a backlog.
    let late: Vec<Duration> = appends
        .iter()
        .filter(|(pts, _)| *pts >= Duration::from_millis(1500))
        .map(|(pts, at)| at.saturating_duration_since(started + *pts))
        .collect();
    assert!(!late.is_empty());
    let worst = late.iter().max().copied().unwrap_or_default();
    assert!(worst < Duration::from_millis(250), "latency {worst:?}");
}
