//! FFmpeg segment container
//!
//! Video frames are piped as raw BGRA into an encoder process writing a
//! temporary video-only file. Audio tracks are spooled as raw `f32le` next to
//! it, placed by timestamp from the first video frame on. Finishing the
//! container muxes everything into the segment file with one AAC track per
//! declared audio track, in declaration order. A track that delivered nothing
//! in this segment is filled with silence so track positions stay the same
//! across segments.

use super::pcm::{PcmTimeline, Placement};
use crate::capture::{SampleBuffer, SampleKind};
use crate::config::RecorderConfig;
use crate::processing::tool::{kbps, quiet_prefix, stderr_tail};
use crate::processing::MediaTool;
use crate::recorder::{ContainerFactory, ContainerSpec, ContainerWriter, WriterError};
use crossbeam_channel::{Sender, TrySendError};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

/// Queued audio buffers per track before it reports not ready
const AUDIO_QUEUE_DEPTH: usize = 256;
/// Zeros written per call when padding a spool
const SILENCE_CHUNK: usize = 64 * 1024;

pub struct FfmpegContainerFactory {
    tool: MediaTool,
    video_encoder: String,
    queue_depth: usize,
}

impl FfmpegContainerFactory {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            tool: MediaTool::new(&config.tools),
            video_encoder: config.video_encoder.clone(),
            queue_depth: config.encoder_queue_depth.max(1),
        }
    }
}

impl ContainerFactory for FfmpegContainerFactory {
    fn create(&self, spec: &ContainerSpec) -> Result<Box<dyn ContainerWriter>, WriterError> {
        let container =
            FfmpegContainer::open(&self.tool, spec.clone(), &self.video_encoder, self.queue_depth)?;
        Ok(Box::new(container))
    }
}

/// `segment_0001.mp4` -> `segment_0001.<suffix>`
fn scratch_path(path: &Path, suffix: &str) -> PathBuf {
    path.with_extension(suffix)
}

pub fn video_encoder_args(spec: &ContainerSpec, encoder: &str, output: &Path) -> Vec<OsString> {
    let mut args = quiet_prefix();
    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "bgra".into(),
        "-s".into(),
        format!("{}x{}", spec.width, spec.height).into(),
        "-r".into(),
        spec.fps.to_string().into(),
        "-i".into(),
        "-".into(),
        // yuv420p needs even dimensions
        "-vf".into(),
        "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
        "-c:v".into(),
        encoder.into(),
        "-b:v".into(),
        spec.video_bitrate.to_string().into(),
    ]);
    if encoder == "libx264" {
        args.extend(["-preset".into(), "veryfast".into()]);
    }
    args.extend([
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-g".into(),
        (spec.fps.max(1) * 2).to_string().into(),
        output.into(),
    ]);
    args
}

/// Audio for one track of a segment, starting at its first video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioInput {
    /// Raw `f32le` spool
    Spool(PathBuf),
    /// Generated silence of the given length
    Silence(Duration),
}

fn channel_layout(channels: u16) -> String {
    match channels {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        n => format!("{n}c"),
    }
}

pub fn audio_mux_args(
    spec: &ContainerSpec,
    video: &Path,
    audio: &[AudioInput],
    output: &Path,
) -> Vec<OsString> {
    let mut args = quiet_prefix();
    args.extend(["-i".into(), video.into()]);
    for input in audio {
        match input {
            AudioInput::Spool(path) => args.extend([
                "-f".into(),
                "f32le".into(),
                "-ar".into(),
                spec.sample_rate.to_string().into(),
                "-ac".into(),
                spec.channels.to_string().into(),
                "-i".into(),
                path.into(),
            ]),
            AudioInput::Silence(length) => args.extend([
                "-f".into(),
                "lavfi".into(),
                "-t".into(),
                format!("{:.3}", length.as_secs_f64()).into(),
                "-i".into(),
                format!(
                    "anullsrc=r={}:cl={}",
                    spec.sample_rate,
                    channel_layout(spec.channels)
                )
                .into(),
            ]),
        }
    }
    args.extend(["-map".into(), "0:v:0".into()]);
    for index in 1..=audio.len() {
        args.push("-map".into());
        args.push(format!("{index}:a:0").into());
    }
    args.extend([
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        kbps(spec.audio_bitrate).into(),
        "-movflags".into(),
        "+faststart".into(),
        output.into(),
    ]);
    args
}

/// Encoder process fed from a bounded frame queue
struct VideoTrack {
    path: PathBuf,
    child: Option<Child>,
    frames: Option<Sender<(Vec<u8>, u32)>>,
    feeder: Option<JoinHandle<std::io::Result<()>>>,
    frame_len: usize,
    /// Last constant-rate slot filled
    last_slot: Option<u64>,
    written: u64,
}

/// One write to a spool: zeros for a gap, then the samples
struct SpoolChunk {
    silence_bytes: u64,
    pcm: Vec<u8>,
}

/// Raw PCM spooled to disk by a feeder thread
struct AudioTrack {
    kind: SampleKind,
    path: PathBuf,
    frame_bytes: usize,
    timeline: Option<PcmTimeline>,
    buffers: Option<Sender<SpoolChunk>>,
    feeder: Option<JoinHandle<std::io::Result<u64>>>,
}

impl AudioTrack {
    fn open(&mut self) -> Result<(), WriterError> {
        let file = File::create(&self.path)?;
        let (tx, rx) = crossbeam_channel::bounded::<SpoolChunk>(AUDIO_QUEUE_DEPTH);
        let feeder = std::thread::Builder::new()
            .name(format!("spool-{}", self.kind.label()))
            .spawn(move || {
                let mut out = BufWriter::new(file);
                let zeros = vec![0u8; SILENCE_CHUNK];
                let mut written = 0u64;
                for chunk in rx {
                    let mut silence = chunk.silence_bytes;
                    while silence > 0 {
                        let n = silence.min(SILENCE_CHUNK as u64) as usize;
                        out.write_all(&zeros[..n])?;
                        silence -= n as u64;
                    }
                    out.write_all(&chunk.pcm)?;
                    written += chunk.silence_bytes + chunk.pcm.len() as u64;
                }
                out.flush()?;
                Ok(written)
            })?;
        self.buffers = Some(tx);
        self.feeder = Some(feeder);
        Ok(())
    }

    /// Close the spool; returns bytes written
    fn close(&mut self) -> u64 {
        self.buffers.take();
        match self.feeder.take().map(JoinHandle::join) {
            Some(Ok(Ok(written))) => written,
            Some(Ok(Err(e))) => {
                tracing::warn!("Audio spool {} failed: {}", self.path.display(), e);
                0
            }
            Some(Err(_)) => {
                tracing::warn!("Audio spool thread for {} panicked", self.path.display());
                0
            }
            None => 0,
        }
    }
}

pub struct FfmpegContainer {
    tool: MediaTool,
    spec: ContainerSpec,
    session_start: Option<Duration>,
    video: VideoTrack,
    audio: Vec<AudioTrack>,
    finished: bool,
}

impl FfmpegContainer {
    pub fn open(
        tool: &MediaTool,
        spec: ContainerSpec,
        encoder: &str,
        queue_depth: usize,
    ) -> Result<Self, WriterError> {
        let video_path = scratch_path(&spec.path, "video.mp4");
        let args = video_encoder_args(&spec, encoder, &video_path);
        tracing::debug!("Starting segment encoder: {:?}", args);

        let mut child = Command::new(tool.ffmpeg_path())
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WriterError::Encoder(format!("Failed to start ffmpeg: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WriterError::Encoder("Failed to capture ffmpeg stdin".to_string()))?;

        let (tx, rx) = crossbeam_channel::bounded::<(Vec<u8>, u32)>(queue_depth);
        let feeder = std::thread::Builder::new()
            .name("segment-video".to_string())
            .spawn(move || {
                let mut previous: Option<Vec<u8>> = None;
                for (frame, repeat) in rx {
                    // Hold the last picture across the gap, then show the new one.
                    let held = previous.as_deref().unwrap_or(&frame[..]);
                    for _ in 1..repeat {
                        stdin.write_all(held)?;
                    }
                    stdin.write_all(&frame)?;
                    previous = Some(frame);
                }
                Ok(())
            });
        let feeder = match feeder {
            Ok(feeder) => feeder,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let audio = spec
            .audio_tracks
            .iter()
            .map(|&kind| AudioTrack {
                kind,
                path: scratch_path(&spec.path, &format!("{}.f32le", kind.label())),
                frame_bytes: spec.channels.max(1) as usize * 4,
                timeline: None,
                buffers: None,
                feeder: None,
            })
            .collect();

        Ok(Self {
            tool: tool.clone(),
            video: VideoTrack {
                path: video_path,
                child: Some(child),
                frames: Some(tx),
                feeder: Some(feeder),
                frame_len: spec.width as usize * spec.height as usize * 4,
                last_slot: None,
                written: 0,
            },
            spec,
            session_start: None,
            audio,
            finished: false,
        })
    }

    fn append_video(&mut self, sample: SampleBuffer) -> Result<(), WriterError> {
        if sample.data.len() != self.video.frame_len {
            tracing::debug!(
                "Skipping frame of {} bytes, expected {}",
                sample.data.len(),
                self.video.frame_len
            );
            return Ok(());
        }

        let start = self.session_start.unwrap_or(sample.pts);
        let fps = self.spec.fps.max(1) as u64;
        let offset = sample.pts.saturating_sub(start);
        let slot = (offset.as_nanos() * fps as u128 / 1_000_000_000) as u64;

        // Frames in an already filled slot exceed the frame rate cap.
        let repeat = match self.video.last_slot {
            None => 1,
            Some(last) if slot <= last => return Ok(()),
            Some(last) => (slot - last).min(fps),
        };

        let Some(frames) = &self.video.frames else {
            return Err(WriterError::Encoder("video track already closed".to_string()));
        };
        match frames.try_send((sample.data, repeat as u32)) {
            Ok(()) => {
                self.video.last_slot = Some(slot);
                self.video.written += repeat;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => {
                Err(WriterError::Encoder("video encoder exited".to_string()))
            }
        }
    }

    fn append_audio(&mut self, sample: SampleBuffer) -> Result<(), WriterError> {
        let origin = self.session_start.unwrap_or(sample.pts);
        let sample_rate = self.spec.sample_rate;
        let track = self
            .audio
            .iter_mut()
            .find(|t| t.kind == sample.kind)
            .ok_or(WriterError::UnknownTrack(sample.kind))?;

        if track.buffers.is_none() {
            track.open()?;
        }
        let timeline = track
            .timeline
            .get_or_insert_with(|| PcmTimeline::new(origin, sample_rate));
        let frames = (sample.data.len() / track.frame_bytes) as u64;
        let placement = timeline.place(sample.pts, frames);
        let Placement::Write { silence, skip } = placement else {
            return Ok(());
        };

        let mut pcm = sample.data;
        pcm.truncate(frames as usize * track.frame_bytes);
        pcm.drain(..skip as usize * track.frame_bytes);
        let chunk = SpoolChunk {
            silence_bytes: silence * track.frame_bytes as u64,
            pcm,
        };
        let Some(buffers) = &track.buffers else {
            return Ok(());
        };
        match buffers.try_send(chunk) {
            Ok(()) => {
                timeline.commit(placement, frames);
                Ok(())
            }
            // Dropped; the next buffer pads the gap.
            Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(WriterError::Encoder(format!(
                "{} audio spool closed",
                sample.kind.label()
            ))),
        }
    }

    /// Close stdin and wait for the encoder to write its file
    fn close_video(&mut self) -> Result<(), WriterError> {
        self.video.frames.take();
        let fed = self.video.feeder.take().map(JoinHandle::join);
        let Some(child) = self.video.child.take() else {
            return Ok(());
        };
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(WriterError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        match fed {
            Some(Ok(Err(e))) => Err(WriterError::Encoder(format!("writing frames failed: {}", e))),
            Some(Err(_)) => Err(WriterError::Encoder("frame feeder panicked".to_string())),
            _ => Ok(()),
        }
    }

    fn mux(&mut self, audio: &[AudioInput]) -> Result<(), WriterError> {
        let args = audio_mux_args(&self.spec, &self.video.path, audio, &self.spec.path);
        self.tool
            .run_ffmpeg(args)
            .map_err(|e| WriterError::Encoder(e.to_string()))
    }

    fn remove_scratch(&self) {
        let scratch = std::iter::once(&self.video.path).chain(self.audio.iter().map(|t| &t.path));
        for path in scratch {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl ContainerWriter for FfmpegContainer {
    fn start_session(&mut self, at: Duration) -> Result<(), WriterError> {
        self.session_start = Some(at);
        Ok(())
    }

    fn is_ready_for_more_data(&self, track: SampleKind) -> bool {
        match track {
            SampleKind::Video => self.video.frames.as_ref().is_some_and(|tx| !tx.is_full()),
            kind => self
                .audio
                .iter()
                .find(|t| t.kind == kind)
                .is_some_and(|t| t.buffers.as_ref().map_or(true, |tx| !tx.is_full())),
        }
    }

    fn append(&mut self, sample: SampleBuffer) -> Result<(), WriterError> {
        if sample.kind.is_audio() {
            self.append_audio(sample)
        } else {
            self.append_video(sample)
        }
    }

    fn finish(mut self: Box<Self>) -> Result<(), WriterError> {
        self.finished = true;
        let video = self.close_video();
        let spooled: Vec<u64> = self.audio.iter_mut().map(AudioTrack::close).collect();

        if let Err(e) = video {
            self.remove_scratch();
            return Err(e);
        }
        if self.video.written == 0 {
            self.remove_scratch();
            return Err(WriterError::Empty(self.spec.path.clone()));
        }

        let length =
            Duration::from_secs_f64(self.video.written as f64 / self.spec.fps.max(1) as f64);
        let inputs: Vec<AudioInput> = self
            .audio
            .iter()
            .zip(spooled)
            .map(|(track, bytes)| {
                if bytes > 0 {
                    if let Some(timeline) = &track.timeline {
                        tracing::debug!(
                            "Spooled {:.2}s of {} audio",
                            timeline.written() as f64 / self.spec.sample_rate.max(1) as f64,
                            track.kind.label()
                        );
                    }
                    AudioInput::Spool(track.path.clone())
                } else {
                    tracing::debug!(
                        "No {} audio in {}, filling with silence",
                        track.kind.label(),
                        self.spec.path.display()
                    );
                    AudioInput::Silence(length)
                }
            })
            .collect();
        if inputs.is_empty() {
            std::fs::rename(&self.video.path, &self.spec.path)?;
            self.remove_scratch();
            tracing::info!("Segment {} written without audio", self.spec.path.display());
            return Ok(());
        }

        let result = match self.mux(&inputs) {
            Ok(()) => {
                tracing::info!(
                    "Segment {} written with {} audio track(s)",
                    self.spec.path.display(),
                    inputs.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Audio mux failed for {}, keeping video only: {}",
                    self.spec.path.display(),
                    e
                );
                std::fs::rename(&self.video.path, &self.spec.path).map_err(WriterError::from)
            }
        };
        self.remove_scratch();
        result
    }
}

impl Drop for FfmpegContainer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.video.frames.take();
        if let Some(mut child) = self.video.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        for track in &mut self.audio {
            track.close();
        }
        self.remove_scratch();
    }
}
