//! RMS level computation
//!
//! Levels are computed from raw float PCM on the capture thread, so the work
//! per buffer is capped at a fixed number of samples.

use crate::capture::SampleKind;
use crate::recorder::SessionObserver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Gain applied to the raw RMS so normal speech reads mid-scale
pub const DEFAULT_GAIN: f32 = 12.0;

/// Samples inspected per buffer
pub const DEFAULT_MAX_SAMPLES: usize = 512;

/// Level meter tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelMeterConfig {
    pub gain: f32,
    pub max_samples: usize,
}

impl Default for LevelMeterConfig {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// Compute a display level from interleaved little-endian `f32` PCM.
///
/// Takes the RMS of at most `max_samples` leading samples, multiplies by the
/// gain and clamps to `[0, 1]`. Empty or unreadable buffers read as silence.
pub fn rms_level(data: &[u8], config: &LevelMeterConfig) -> f32 {
    let mut sum = 0.0f64;
    let mut count = 0usize;

    for chunk in data.chunks_exact(4).take(config.max_samples) {
        let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !sample.is_finite() {
            continue;
        }
        sum += (sample as f64) * (sample as f64);
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }

    let rms = (sum / count as f64).sqrt() as f32;
    (rms * config.gain).clamp(0.0, 1.0)
}

/// Latest level per audio channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevels {
    pub mic: f32,
    pub system: f32,
}

/// Shared level state for one session.
///
/// Both audio channels update it from their own capture threads; each update
/// publishes the full pair to the observer.
pub struct LevelMonitor {
    config: LevelMeterConfig,
    levels: Mutex<AudioLevels>,
    observer: Arc<dyn SessionObserver>,
}

impl LevelMonitor {
    pub fn new(config: LevelMeterConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            config,
            levels: Mutex::new(AudioLevels::default()),
            observer,
        }
    }

    /// Meter one audio buffer and publish the updated pair
    pub fn observe(&self, kind: SampleKind, data: &[u8]) {
        let level = rms_level(data, &self.config);
        let snapshot = {
            let mut levels = self.levels.lock();
            match kind {
                SampleKind::MicAudio => levels.mic = level,
                SampleKind::SystemAudio => levels.system = level,
                SampleKind::Video => return,
            }
            *levels
        };
        self.observer.on_levels(snapshot.mic, snapshot.system);
    }

    pub fn levels(&self) -> AudioLevels {
        *self.levels.lock()
    }

    pub fn reset(&self) {
        *self.levels.lock() = AudioLevels::default();
    }
}
