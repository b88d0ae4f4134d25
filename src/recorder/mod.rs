//! Recording system module
//!
//! This module implements the segmented recording architecture:
//! - `SegmentScheduler` decides when segment files rotate
//! - `SegmentWriter` wraps one open container with a drop-not-block policy
//! - the writer context thread owns both and serializes all samples
//! - `Recorder` drives the session lifecycle and post-processing

pub(crate) mod context;
pub mod coordinator;
pub mod observer;
pub mod scheduler;
pub mod state;
pub mod writer;

pub use coordinator::{Recorder, SessionHandle};
pub use observer::{BroadcastObserver, NoopObserver, RecordingEvent, SessionObserver};
pub use scheduler::{segment_file_name, Segment, SegmentDecision, SegmentScheduler};
pub use state::{CaptureSession, SessionConfig, SessionState, SEGMENT_DIR_NAME};
pub use writer::{
    AppendOutcome, ContainerFactory, ContainerSpec, ContainerWriter, DropReason, FinalizedSegment,
    PendingFinalize, SegmentWriter, TrackStats, WriterError, WriterStats,
};
