//! screentape - record a display with system and microphone audio
//!
//! Subcommands:
//! - `screentape record` - Record until Ctrl-C (or `--duration`), then process
//! - `screentape displays` - List capturable displays
//! - `screentape microphones` - List audio inputs
//! - `screentape config` - Print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use screentape::capture::{SampleSource, SyntheticConfig, SyntheticSource};
use screentape::{
    AppError, AppResult, BroadcastObserver, ErrorResponse, FfmpegContainerFactory,
    PipelineReport, Recorder, RecorderConfig, RecordingEvent, SessionConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "screentape")]
#[command(about = "Segmented screen and audio recorder")]
#[command(version)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, env = "SCREENTAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Use the generated test pattern instead of a real display
    #[arg(long, global = true)]
    synthetic: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the screen until Ctrl-C
    Record {
        /// Directory for the finished recording
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// File name without extension
        #[arg(short, long)]
        name: Option<String>,

        /// Display id (see `displays`)
        #[arg(short, long)]
        display: Option<u32>,

        /// Microphone id (see `microphones`), or "default"
        #[arg(short, long)]
        mic: Option<String>,

        /// Also write an MP3 of the mixed audio
        #[arg(long)]
        mp3: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// List displays
    Displays,

    /// List microphones
    Microphones,

    /// Print the effective configuration as JSON
    Config,
}

fn load_config(path: Option<&Path>) -> AppResult<RecorderConfig> {
    let config = match path {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn build_source(synthetic: bool, config: &RecorderConfig) -> Arc<dyn SampleSource> {
    #[cfg(target_os = "macos")]
    if !synthetic {
        return Arc::new(screentape::capture::macos::MacCaptureSource::new(
            config.system_audio_device.clone(),
        ));
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = config;
        if !synthetic {
            tracing::warn!("No screen capture backend on this platform, using synthetic source");
        }
    }
    Arc::new(SyntheticSource::new(SyntheticConfig::default()))
}

#[tokio::main]
async fn main() -> Result<()> {
    screentape::init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    let source = build_source(cli.synthetic, &config);

    match cli.command {
        Commands::Record {
            output_dir,
            name,
            display,
            mic,
            mp3,
            duration,
        } => {
            let mut session = SessionConfig::new(output_dir).with_sidecar_audio(mp3);
            if let Some(name) = name {
                session = session.with_file_stem(name);
            }
            if let Some(display) = display {
                session = session.with_display(display);
            }
            if let Some(mic) = mic {
                session = session.with_microphone(mic);
            }

            let report = record(config, source, session, duration.map(Duration::from_secs))
                .await
                .map_err(report_error)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.outcome.is_failure() {
                anyhow::bail!("Post-processing failed, segments kept in place");
            }
        }

        Commands::Displays => {
            println!("{}", serde_json::to_string_pretty(&source.list_displays())?);
        }

        Commands::Microphones => {
            println!("{}", serde_json::to_string_pretty(&source.list_microphones())?);
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Print a failed start as JSON on stderr, with a hint for refused permissions
fn report_error(error: AppError) -> anyhow::Error {
    if error.code() == "PERMISSION_DENIED" {
        eprintln!(
            "Allow Screen Recording (and Microphone, if used) for this terminal in \
             System Settings > Privacy & Security, then try again."
        );
        #[cfg(target_os = "macos")]
        screentape::capture::macos::open_screen_recording_preferences();
    }
    let response = ErrorResponse::from(error);
    if let Ok(json) = serde_json::to_string(&response) {
        eprintln!("{json}");
    }
    anyhow::anyhow!("Recording failed: {}", response.message)
}

async fn record(
    config: RecorderConfig,
    source: Arc<dyn SampleSource>,
    session: SessionConfig,
    duration: Option<Duration>,
) -> AppResult<PipelineReport> {
    let observer = Arc::new(BroadcastObserver::default());
    let mut events = observer.subscribe();
    let containers = Arc::new(FfmpegContainerFactory::new(&config));
    let recorder = Recorder::new(config, source, containers).with_observer(observer);

    let handle = recorder.start_session(session).await?;
    tracing::info!("Recording to {}", handle.session().output_path.display());

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RecordingEvent::StateChanged { recording } => {
                    tracing::info!("Recording: {}", recording);
                }
                RecordingEvent::Levels(levels) => {
                    tracing::trace!("Levels mic={:.2} system={:.2}", levels.mic, levels.system);
                }
                RecordingEvent::ProcessingComplete(report) => {
                    tracing::info!("Processing complete: {:?}", report.outcome);
                }
            }
        }
    });

    let stop_after = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping");
            handle.stop();
        }
        _ = stop_after => {
            tracing::info!("Duration reached, stopping");
            handle.stop();
        }
        _ = handle.wait() => {}
    }

    Ok(handle.wait().await)
}
