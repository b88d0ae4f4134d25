//! Sample sources
//!
//! A source produces timestamped video frames and audio buffers and hands
//! them to the recorder through [`SourceOutputs`].

pub mod audio;
pub mod delivery;
pub mod synthetic;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod macos;

pub use delivery::{Delivery, DeliveryChannel, SourceOutputs, StopTrigger};
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use traits::{
    f32_to_bytes, AudioDeviceInfo, CaptureError, CaptureRequest, DisplayInfo, DisplayMetadata,
    SampleBuffer, SampleKind, SampleSource, SessionClock, StreamEnd,
};

/// Check if screen recording permission is granted
pub fn has_screen_recording_permission() -> bool {
    #[cfg(target_os = "macos")]
    {
        macos::has_screen_recording_permission()
    }
    #[cfg(not(target_os = "macos"))]
    {
        false
    }
}
