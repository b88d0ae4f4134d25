//! ffmpeg / ffprobe wrapper
//!
//! Every invocation is built as an argument vector by a small pure function
//! and run synchronously. Callers on an async runtime run these from
//! blocking tasks.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Lines of stderr kept in error messages
const STDERR_TAIL_LINES: usize = 12;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0} is not available")]
    Unavailable(String),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected {program} output: {reason}")]
    Parse { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where to find the media tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Stream listing returned by ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaProbe {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: Option<ProbeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub codec_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub duration: Option<String>,
}

impl MediaProbe {
    pub fn parse(json: &[u8]) -> Result<Self, ToolError> {
        serde_json::from_slice(json).map_err(|e| ToolError::Parse {
            program: "ffprobe".into(),
            reason: e.to_string(),
        })
    }

    pub fn audio_streams(&self) -> usize {
        self.streams.iter().filter(|s| s.codec_type == "audio").count()
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.codec_type == "video")
    }

    pub fn duration(&self) -> Option<Duration> {
        self.format
            .as_ref()?
            .duration
            .as_deref()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Handle on the external media tools
#[derive(Debug, Clone)]
pub struct MediaTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl MediaTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
        }
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    /// Check if ffmpeg can be run
    pub fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Check if this ffmpeg build has an encoder
    pub fn has_encoder(&self, name: &str) -> bool {
        match self.run(&self.ffmpeg, vec!["-hide_banner".into(), "-encoders".into()]) {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(name)),
            Err(_) => false,
        }
    }

    pub fn probe(&self, path: &Path) -> Result<MediaProbe, ToolError> {
        let output = self.run(&self.ffprobe, probe_args(path))?;
        MediaProbe::parse(&output.stdout)
    }

    /// Number of audio streams in a media file.
    ///
    /// Falls back to reading the ffmpeg input banner when ffprobe is missing.
    pub fn audio_stream_count(&self, path: &Path) -> Result<usize, ToolError> {
        match self.probe(path) {
            Ok(probe) => Ok(probe.audio_streams()),
            Err(ToolError::Unavailable(_)) => {
                tracing::debug!("ffprobe unavailable, reading ffmpeg banner instead");
                let output = self.output(
                    &self.ffmpeg,
                    vec!["-hide_banner".into(), "-i".into(), path.into()],
                )?;
                Ok(count_audio_streams_in_banner(&String::from_utf8_lossy(
                    &output.stderr,
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Fold the first two audio tracks of `input` into one AAC track
    pub fn mix_audio(&self, input: &Path, output: &Path, bitrate: u32) -> Result<(), ToolError> {
        tracing::info!("Mixing audio tracks of {}", input.display());
        self.run_ffmpeg(mix_audio_args(input, output, bitrate))
    }

    /// Export the audio of `input` as MP3
    pub fn export_audio(&self, input: &Path, output: &Path, quality: u8) -> Result<(), ToolError> {
        tracing::info!("Exporting audio to {}", output.display());
        self.run_ffmpeg(export_audio_args(input, output, quality))
    }

    /// Join the files listed in a concat list without re-encoding
    pub fn concat(&self, list: &Path, output: &Path, audio_tracks: usize) -> Result<(), ToolError> {
        self.run_ffmpeg(concat_args(list, output, audio_tracks))
    }

    pub(crate) fn run_ffmpeg(&self, args: Vec<OsString>) -> Result<(), ToolError> {
        tracing::debug!("Running ffmpeg: {:?}", args);
        self.run(&self.ffmpeg, args).map(|_| ())
    }

    /// Run a tool and require a zero exit status
    fn run(&self, program: &Path, args: Vec<OsString>) -> Result<Output, ToolError> {
        let output = self.output(program, args)?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                program: program.display().to_string(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }
        Ok(output)
    }

    fn output(&self, program: &Path, args: Vec<OsString>) -> Result<Output, ToolError> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::Unavailable(program.display().to_string())
                } else {
                    ToolError::Spawn {
                        program: program.display().to_string(),
                        source: e,
                    }
                }
            })
    }
}

pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Count `Stream #0:N...: Audio:` lines in an ffmpeg input banner
pub fn count_audio_streams_in_banner(banner: &str) -> usize {
    banner
        .lines()
        .map(str::trim_start)
        .filter(|line| line.starts_with("Stream #") && line.contains(": Audio:"))
        .count()
}

pub(crate) fn quiet_prefix() -> Vec<OsString> {
    ["-hide_banner", "-loglevel", "error", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

pub(crate) fn kbps(bitrate: u32) -> String {
    format!("{}k", bitrate / 1000)
}

pub fn probe_args(path: &Path) -> Vec<OsString> {
    vec![
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "stream=index,codec_type:format=duration".into(),
        "-of".into(),
        "json".into(),
        path.into(),
    ]
}

pub fn mix_audio_args(input: &Path, output: &Path, bitrate: u32) -> Vec<OsString> {
    let mut args = quiet_prefix();
    args.extend([
        "-i".into(),
        input.into(),
        "-filter_complex".into(),
        "[0:a:0][0:a:1]amix=inputs=2:duration=longest[aout]".into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "[aout]".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        kbps(bitrate).into(),
        "-movflags".into(),
        "+faststart".into(),
        output.into(),
    ]);
    args
}

pub fn export_audio_args(input: &Path, output: &Path, quality: u8) -> Vec<OsString> {
    let mut args = quiet_prefix();
    args.extend([
        "-i".into(),
        input.into(),
        "-vn".into(),
        "-c:a".into(),
        "libmp3lame".into(),
        "-q:a".into(),
        quality.min(9).to_string().into(),
        output.into(),
    ]);
    args
}

pub fn concat_args(list: &Path, output: &Path, audio_tracks: usize) -> Vec<OsString> {
    let mut args = quiet_prefix();
    args.extend([
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.into(),
        "-map".into(),
        "0:v:0".into(),
    ]);
    for track in 0..audio_tracks {
        args.push("-map".into());
        args.push(format!("0:a:{track}").into());
    }
    args.extend([
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.into(),
    ]);
    args
}
