//! Segment containers backed by an ffmpeg subprocess

mod ffmpeg;
mod pcm;

pub use ffmpeg::{
    audio_mux_args, video_encoder_args, AudioInput, FfmpegContainer, FfmpegContainerFactory,
};
