//! macOS sample source
//!
//! Combines the CoreGraphics frame grabber with cpal audio inputs. System
//! audio is read from a loopback input device when one is configured.

use super::permissions::{has_screen_recording_permission, request_screen_recording_permission};
use super::screen::{get_displays, probe_display, resolve_display, ScreenGrabber};
use crate::capture::audio::{list_input_devices, AudioFormat, AudioInputCapture};
use crate::capture::{
    AudioDeviceInfo, CaptureError, CaptureRequest, DisplayInfo, DisplayMetadata, SampleKind,
    SampleSource, SourceOutputs,
};
use async_trait::async_trait;
use parking_lot::Mutex;

struct ActiveCapture {
    screen: ScreenGrabber,
    system_audio: Option<AudioInputCapture>,
    mic_audio: Option<AudioInputCapture>,
}

impl ActiveCapture {
    fn stop(self) {
        self.screen.stop();
        if let Some(capture) = self.system_audio {
            capture.stop();
        }
        if let Some(capture) = self.mic_audio {
            capture.stop();
        }
    }
}

pub struct MacCaptureSource {
    system_audio_device: Option<String>,
    active: Mutex<Option<ActiveCapture>>,
}

impl MacCaptureSource {
    /// `system_audio_device` names a loopback input (e.g. BlackHole); without
    /// one there is no system track.
    pub fn new(system_audio_device: Option<String>) -> Self {
        Self {
            system_audio_device,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SampleSource for MacCaptureSource {
    async fn start(
        &self,
        request: &CaptureRequest,
        outputs: SourceOutputs,
    ) -> Result<DisplayMetadata, CaptureError> {
        if self.active.lock().is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        if !has_screen_recording_permission() {
            request_screen_recording_permission();
            return Err(CaptureError::PermissionDenied(
                "Screen recording permission not granted. Please allow in System Settings."
                    .to_string(),
            ));
        }

        let display = resolve_display(request.display_id)?;
        let metadata = probe_display(&display, request.max_fps)?;
        let format = AudioFormat {
            sample_rate: request.sample_rate,
            channels: request.channels,
        };

        let mic_audio = match &request.microphone_id {
            Some(id) => Some(AudioInputCapture::start(
                Some(id.as_str()),
                outputs.mic_audio.clone(),
                outputs.clock,
                format,
            )?),
            None => None,
        };

        let system_audio = match &self.system_audio_device {
            Some(device) => match AudioInputCapture::start(
                Some(device.as_str()),
                outputs.system_audio.clone(),
                outputs.clock,
                format,
            ) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    tracing::warn!("System audio unavailable, recording without it: {}", e);
                    None
                }
            },
            None => {
                tracing::info!("No loopback device configured, recording without system audio");
                None
            }
        };

        let screen = match ScreenGrabber::start(metadata, outputs) {
            Ok(screen) => screen,
            Err(e) => {
                if let Some(capture) = mic_audio {
                    capture.stop();
                }
                if let Some(capture) = system_audio {
                    capture.stop();
                }
                return Err(e);
            }
        };

        *self.active.lock() = Some(ActiveCapture {
            screen,
            system_audio,
            mic_audio,
        });
        Ok(metadata)
    }

    async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        let _ = tokio::task::spawn_blocking(move || active.stop()).await;
    }

    fn audio_tracks(&self, _request: &CaptureRequest) -> Vec<SampleKind> {
        let active = self.active.lock();
        let Some(active) = active.as_ref() else {
            return Vec::new();
        };
        let mut tracks = Vec::new();
        if active.system_audio.is_some() {
            tracks.push(SampleKind::SystemAudio);
        }
        if active.mic_audio.is_some() {
            tracks.push(SampleKind::MicAudio);
        }
        tracks
    }

    fn list_microphones(&self) -> Vec<AudioDeviceInfo> {
        list_input_devices()
    }

    fn list_displays(&self) -> Vec<DisplayInfo> {
        get_displays()
    }
}
