//! screentape - segmented screen and audio recording.
//!
//! This is the library crate behind the `screentape` recorder. It captures a
//! display plus system and microphone audio, writes rotating MP4 segments while
//! recording, and after stop reassembles them into one playable file with a
//! single mixed audio track.

pub mod capture;
pub mod config;
pub mod encode;
pub mod meter;
pub mod processing;
pub mod recorder;
pub mod utils;

pub use capture::{
    AudioDeviceInfo, CaptureError, CaptureRequest, DisplayInfo, DisplayMetadata, SampleBuffer,
    SampleKind, SampleSource, SourceOutputs, StreamEnd,
};
pub use config::RecorderConfig;
pub use encode::FfmpegContainerFactory;
pub use processing::{MediaTool, PipelineOutcome, PipelineReport};
pub use recorder::{
    BroadcastObserver, Recorder, RecordingEvent, SessionConfig, SessionHandle, SessionObserver,
    SessionState,
};
pub use utils::error::{AppError, AppResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// Honors `RUST_LOG`; defaults to debug output for this crate. Calling it more
/// than once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screentape=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
