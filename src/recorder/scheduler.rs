//! Segment rotation
//!
//! Decides, from video timestamps alone, when the current segment file should
//! be closed and the next one opened. Audio never triggers a rotation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One container file covering a contiguous range of the session timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// 1-based, contiguous within a session
    pub index: u32,
    pub path: PathBuf,
    pub start: Duration,
    /// Set once the segment is closed
    pub end: Option<Duration>,
}

impl Segment {
    pub fn span(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

pub fn segment_file_name(index: u32) -> String {
    format!("segment_{index:04}.mp4")
}

/// What the writer must do for an incoming video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentDecision {
    /// First frame of the session: open this segment
    Open(Segment),
    /// Budget exceeded: finalize `closed`, then open `opened`
    Rotate { closed: Segment, opened: Segment },
    /// Keep writing to the current segment
    Continue,
}

#[derive(Debug)]
pub struct SegmentScheduler {
    directory: PathBuf,
    budget: Duration,
    next_index: u32,
    current: Option<Segment>,
    last_frame: Option<Duration>,
    closed: Vec<Segment>,
}

impl SegmentScheduler {
    pub fn new(directory: impl Into<PathBuf>, budget: Duration) -> Self {
        Self {
            directory: directory.into(),
            budget,
            next_index: 1,
            current: None,
            last_frame: None,
            closed: Vec::new(),
        }
    }

    /// Closed segments, in order
    pub fn segments(&self) -> &[Segment] {
        &self.closed
    }

    pub fn on_video_frame(&mut self, pts: Duration) -> SegmentDecision {
        if self.last_frame.map_or(true, |last| pts > last) {
            self.last_frame = Some(pts);
        }

        let Some(current) = &self.current else {
            return SegmentDecision::Open(self.begin(pts));
        };

        if pts.saturating_sub(current.start) < self.budget {
            return SegmentDecision::Continue;
        }

        let mut closed = match self.current.take() {
            Some(segment) => segment,
            None => return SegmentDecision::Open(self.begin(pts)),
        };
        closed.end = Some(pts);
        self.closed.push(closed.clone());

        let opened = self.begin(pts);
        tracing::debug!(
            "Rotating {} -> {} at {:.3}s",
            closed.index,
            opened.index,
            pts.as_secs_f64()
        );
        SegmentDecision::Rotate { closed, opened }
    }

    /// Close the current segment at the last frame seen
    pub fn close(&mut self) -> Option<Segment> {
        let mut segment = self.current.take()?;
        let end = self.last_frame.unwrap_or(segment.start).max(segment.start);
        segment.end = Some(end);
        self.closed.push(segment.clone());
        Some(segment)
    }

    /// Forget the current segment after its file could not be opened.
    ///
    /// The index is released so numbering stays contiguous.
    pub fn abandon_current(&mut self) -> Option<Segment> {
        let segment = self.current.take()?;
        self.next_index = segment.index;
        Some(segment)
    }

    fn begin(&mut self, pts: Duration) -> Segment {
        let index = self.next_index;
        self.next_index += 1;
        let segment = Segment {
            index,
            path: self.directory.join(segment_file_name(index)),
            start: pts,
            end: None,
        };
        self.current = Some(segment.clone());
        segment
    }
}
