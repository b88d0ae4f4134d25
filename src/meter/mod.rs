//! Audio level metering
//!
//! Derives a 0..1 loudness value from each audio buffer as it is delivered and
//! keeps the latest microphone/system pair for UI meters.

mod level;

pub use level::{rms_level, AudioLevels, LevelMeterConfig, LevelMonitor};
