//! PCM placement
//!
//! Audio buffers carry capture timestamps, but a raw spool has no timestamps
//! of its own: its position is the number of frames written so far. The
//! timeline pads gaps with silence and trims overlap so that position keeps
//! following the timestamps.

use std::time::Duration;

/// Drift tolerated before the timeline corrects with silence or a trim
pub const PCM_TOLERANCE: Duration = Duration::from_millis(20);

/// How one buffer lands on the spool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Write `silence` frames, then the buffer minus its first `skip` frames
    Write { silence: u64, skip: u64 },
    /// The buffer lies entirely inside audio already written
    Discard,
}

#[derive(Debug, Clone)]
pub struct PcmTimeline {
    origin: Duration,
    sample_rate: u32,
    tolerance: u64,
    written: u64,
}

impl PcmTimeline {
    /// Timeline whose frame zero sits at `origin`
    pub fn new(origin: Duration, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            origin,
            sample_rate,
            tolerance: frames_in(PCM_TOLERANCE, sample_rate),
            written: 0,
        }
    }

    /// Frames placed so far, silence included
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Where a buffer of `frames` stamped `pts` goes. Nothing is committed.
    pub fn place(&self, pts: Duration, frames: u64) -> Placement {
        let due = frames_in(pts.saturating_sub(self.origin), self.sample_rate);
        if due > self.written + self.tolerance {
            Placement::Write {
                silence: due - self.written,
                skip: 0,
            }
        } else if due + self.tolerance < self.written {
            let overlap = self.written - due;
            if overlap >= frames {
                Placement::Discard
            } else {
                Placement::Write {
                    silence: 0,
                    skip: overlap,
                }
            }
        } else {
            Placement::Write { silence: 0, skip: 0 }
        }
    }

    /// Record that `placement` of a `frames` long buffer reached the spool
    pub fn commit(&mut self, placement: Placement, frames: u64) {
        if let Placement::Write { silence, skip } = placement {
            self.written += silence + frames.saturating_sub(skip);
        }
    }
}

fn frames_in(span: Duration, sample_rate: u32) -> u64 {
    (span.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}
