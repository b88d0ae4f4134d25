//! Synthetic capture source
//!
//! Generates a moving test pattern and sine tones in real time. Used on
//! platforms without a screen capture backend and for exercising the full
//! recording path without hardware.

use super::delivery::SourceOutputs;
use super::traits::{
    f32_to_bytes, AudioDeviceInfo, CaptureError, CaptureRequest, DisplayInfo, DisplayMetadata,
    SampleSource, SessionClock, StreamEnd,
};
use super::DeliveryChannel;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const SYNTHETIC_DISPLAY_ID: u32 = 1;
const SYNTHETIC_MIC_ID: &str = "synthetic-mic";
/// Audio buffer length
const AUDIO_CHUNK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// End the stream on its own, as if the user stopped sharing
    pub end_after: Option<Duration>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            end_after: None,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn spawn(&self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<(), CaptureError> {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        self.threads.lock().push(handle);
        Ok(())
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

#[async_trait]
impl SampleSource for SyntheticSource {
    async fn start(
        &self,
        request: &CaptureRequest,
        outputs: SourceOutputs,
    ) -> Result<DisplayMetadata, CaptureError> {
        if let Some(id) = request.display_id.filter(|id| *id != SYNTHETIC_DISPLAY_ID) {
            return Err(CaptureError::SetupFailed(format!("unknown display {id}")));
        }
        if let Some(mic) = request.microphone_id.as_deref() {
            if mic != SYNTHETIC_MIC_ID && mic != "default" {
                return Err(CaptureError::SetupFailed(format!("unknown microphone {mic}")));
            }
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRecording);
        }

        let metadata = DisplayMetadata {
            display_id: SYNTHETIC_DISPLAY_ID,
            width: self.config.width,
            height: self.config.height,
            fps: request.max_fps.max(1),
        };

        let video = {
            let running = self.running.clone();
            let outputs = outputs.clone();
            let end_after = self.config.end_after;
            move || run_video(metadata, outputs, running, end_after)
        };
        self.spawn("synthetic-video", video)?;

        let tone = Tone {
            sample_rate: request.sample_rate.max(1),
            channels: request.channels.max(1),
            frequency: 440.0,
            amplitude: 0.05,
        };
        let system = {
            let running = self.running.clone();
            let channel = outputs.system_audio.clone();
            move || run_tone(tone, channel, outputs.clock, running)
        };
        self.spawn("synthetic-system", system)?;

        if request.microphone_id.is_some() {
            let running = self.running.clone();
            let mic_tone = Tone {
                frequency: 660.0,
                amplitude: 0.02,
                ..tone
            };
            let channel = outputs.mic_audio.clone();
            let clock = outputs.clock;
            self.spawn("synthetic-mic", move || run_tone(mic_tone, channel, clock, running))?;
        }

        tracing::info!(
            "Synthetic capture started at {}x{} @ {}fps",
            metadata.width,
            metadata.height,
            metadata.fps
        );
        Ok(metadata)
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        let _ = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
        tracing::info!("Synthetic capture stopped");
    }

    fn list_microphones(&self) -> Vec<AudioDeviceInfo> {
        vec![AudioDeviceInfo {
            id: SYNTHETIC_MIC_ID.to_string(),
            name: "Synthetic Microphone".to_string(),
            is_input: true,
            is_default: true,
        }]
    }

    fn list_displays(&self) -> Vec<DisplayInfo> {
        vec![DisplayInfo {
            id: SYNTHETIC_DISPLAY_ID,
            name: "Synthetic Display".to_string(),
            width: self.config.width,
            height: self.config.height,
            scale_factor: 1.0,
            is_primary: true,
            refresh_rate: Some(60),
        }]
    }
}

fn run_video(
    metadata: DisplayMetadata,
    outputs: SourceOutputs,
    running: Arc<AtomicBool>,
    end_after: Option<Duration>,
) {
    let fps = metadata.fps.max(1) as u64;
    let mut frame = 0u64;
    while running.load(Ordering::SeqCst) {
        let due = Duration::from_nanos(frame * 1_000_000_000 / fps);
        std::thread::sleep(due.saturating_sub(outputs.clock.now()));

        let pts = outputs.clock.now();
        if end_after.is_some_and(|limit| pts >= limit) {
            outputs.stop.fire(StreamEnd::UserStopped);
            break;
        }
        outputs
            .video
            .send(pts, test_pattern(metadata.width, metadata.height, frame));
        frame += 1;
    }
}

#[derive(Debug, Clone, Copy)]
struct Tone {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    amplitude: f32,
}

fn run_tone(tone: Tone, channel: DeliveryChannel, clock: SessionClock, running: Arc<AtomicBool>) {
    let frames_per_chunk = (tone.sample_rate as u128 * AUDIO_CHUNK.as_millis() / 1000) as usize;
    let mut produced = 0u64;
    while running.load(Ordering::SeqCst) {
        let due = Duration::from_secs_f64(produced as f64 / tone.sample_rate as f64);
        std::thread::sleep(due.saturating_sub(clock.now()));

        let mut samples = Vec::with_capacity(frames_per_chunk * tone.channels as usize);
        for i in 0..frames_per_chunk as u64 {
            let t = (produced + i) as f32 / tone.sample_rate as f32;
            let value = (t * tone.frequency * TAU).sin() * tone.amplitude;
            samples.extend(std::iter::repeat(value).take(tone.channels as usize));
        }
        channel.send(due, f32_to_bytes(&samples));
        produced += frames_per_chunk as u64;
    }
}

/// BGRA frame with a vertical bar sweeping left to right
pub fn test_pattern(width: u32, height: u32, frame: u64) -> Vec<u8> {
    let width = width as usize;
    let bar_x = (frame as usize * 8) % width.max(1);
    let bar_width = (width / 32).max(1);
    let mut row = vec![0u8; width * 4];
    for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
        let on_bar = x >= bar_x && x < bar_x + bar_width;
        let shade = if on_bar { 0xff } else { (x * 255 / width.max(1)) as u8 / 4 };
        pixel.copy_from_slice(&[shade, shade / 2, 0x20, 0xff]);
    }
    row.repeat(height as usize)
}
