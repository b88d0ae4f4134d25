//! Post-processing
//!
//! Turns the sealed segments of a stopped session into the final file:
//! consolidation, audio mixing and the optional MP3 sidecar. All media work
//! is delegated to an external ffmpeg.

pub mod compose;
pub mod pipeline;
pub mod tool;
pub mod types;

pub use compose::{FfmpegConcat, SegmentComposer};
pub use pipeline::{PipelinePlan, PostProcessor};
pub use tool::{MediaProbe, MediaTool, ToolConfig, ToolError};
pub use types::{ConsolidateError, PipelineOutcome, PipelineReport, PipelineStage};
