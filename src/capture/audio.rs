//! Audio input capture using cpal
//!
//! Each capture owns a thread that holds the cpal stream, since streams are
//! not `Send`. Input is converted to interleaved `f32` at the session's
//! sample rate and channel count before delivery.

use super::delivery::DeliveryChannel;
use super::traits::{AudioDeviceInfo, CaptureError, SessionClock};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Target PCM layout for delivered audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// List input devices, default first
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices: Vec<AudioDeviceInfo> = match host.input_devices() {
        Ok(devices) => devices
            .filter_map(|device| device.name().ok())
            .map(|name| AudioDeviceInfo {
                id: name.clone(),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                is_input: true,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate input devices: {}", e);
            Vec::new()
        }
    };
    devices.sort_by_key(|device| !device.is_default);
    devices
}

fn find_input_device(id: Option<&str>) -> Option<Device> {
    let host = cpal::default_host();
    match id {
        None | Some("default") => host.default_input_device(),
        Some(id) => host
            .input_devices()
            .ok()?
            .find(|device| device.name().map(|n| n == id).unwrap_or(false)),
    }
}

/// Converts device buffers to the session layout and delivers them
#[derive(Clone)]
struct AudioForwarder {
    channel: DeliveryChannel,
    clock: SessionClock,
    source: AudioFormat,
    target: AudioFormat,
}

impl AudioForwarder {
    fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let remixed = remix_channels(samples, self.source.channels, self.target.channels);
        let converted = resample_linear(
            &remixed,
            self.target.channels,
            self.source.sample_rate,
            self.target.sample_rate,
        );

        // The callback runs just after the buffer was filled; date it from its start.
        let frames = samples.len() / self.source.channels.max(1) as usize;
        let span = Duration::from_secs_f64(frames as f64 / self.source.sample_rate.max(1) as f64);
        let pts = self.clock.now().saturating_sub(span);

        self.channel
            .send(pts, super::traits::f32_to_bytes(&converted));
    }
}

/// A running input capture
pub struct AudioInputCapture {
    device_name: String,
    is_recording: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioInputCapture {
    /// Open `device_id` (or the default input) and start delivering into `channel`
    pub fn start(
        device_id: Option<&str>,
        channel: DeliveryChannel,
        clock: SessionClock,
        target: AudioFormat,
    ) -> Result<Self, CaptureError> {
        let device_id = device_id.map(str::to_string);
        let is_recording = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String, CaptureError>>(1);

        let running = is_recording.clone();
        let label = channel.kind().label();
        let thread = std::thread::Builder::new()
            .name(format!("audio-{label}"))
            .spawn(move || {
                let stream = match build_stream(device_id.as_deref(), channel, clock, target) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep thread alive while recording
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(device_name)) => {
                tracing::info!("Audio capture ({}) started on {}", label, device_name);
                Ok(Self {
                    device_name,
                    is_recording,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureError::SetupFailed(format!(
                    "{label} audio thread exited during setup"
                )))
            }
        }
    }

    /// Stop the stream and wait for its thread
    pub fn stop(mut self) {
        self.is_recording.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!("Audio capture on {} stopped", self.device_name);
    }
}

fn build_stream(
    device_id: Option<&str>,
    channel: DeliveryChannel,
    clock: SessionClock,
    target: AudioFormat,
) -> Result<(cpal::Stream, String), CaptureError> {
    let device = find_input_device(device_id).ok_or_else(|| {
        CaptureError::SetupFailed(format!(
            "audio input '{}' not found",
            device_id.unwrap_or("default")
        ))
    })?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| setup_error(&name, e))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let forwarder = AudioForwarder {
        channel,
        clock,
        source: AudioFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        },
        target,
    };
    let err_name = name.clone();
    let on_error = move |err: cpal::StreamError| {
        tracing::warn!("Audio stream error on {}: {}", err_name, err);
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forwarder.push(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> =
                    data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                forwarder.push(&converted)
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 - 32768.0) / 32768.0)
                    .collect();
                forwarder.push(&converted)
            },
            on_error,
            None,
        ),
        other => {
            return Err(CaptureError::SetupFailed(format!(
                "{name}: unsupported sample format {other:?}"
            )))
        }
    }
    .map_err(|e| setup_error(&name, e))?;

    stream.play().map_err(|e| setup_error(&name, e))?;
    Ok((stream, name))
}

/// cpal reports backend failures as text; a refused microphone only shows
/// up in the message.
fn setup_error(device: &str, err: impl std::fmt::Display) -> CaptureError {
    const REFUSALS: [&str; 5] = [
        "permission",
        "not permitted",
        "denied",
        "not authorized",
        "unauthorized",
    ];
    let message = err.to_string();
    let lower = message.to_lowercase();
    if REFUSALS.iter().any(|marker| lower.contains(marker)) {
        CaptureError::PermissionDenied(format!("{device}: {message}"))
    } else {
        CaptureError::SetupFailed(format!("{device}: {message}"))
    }
}

/// Convert interleaved audio between channel counts.
///
/// Mono is duplicated into every output channel; wider input is folded by
/// averaging into mono, or truncated to the first channels otherwise.
pub fn remix_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = from.max(1) as usize;
    let to = to.max(1) as usize;
    if from == to {
        return samples.to_vec();
    }

    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat(frame[0]).take(to));
        } else if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for c in 0..to {
                out.push(frame[c.min(from - 1)]);
            }
        }
    }
    out
}

/// Linear resampling of interleaved audio
pub fn resample_linear(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let in_frames = samples.len() / channels;
    if in_frames == 0 {
        return Vec::new();
    }
    let out_frames = ((in_frames as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;

    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let position = i as f64 * step;
        let index = (position as usize).min(in_frames - 1);
        let next = (index + 1).min(in_frames - 1);
        let frac = (position - index as f64) as f32;
        for c in 0..channels {
            let a = samples[index * channels + c];
            let b = samples[next * channels + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}
