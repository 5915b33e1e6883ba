//! Recorded-trace backend: a synthetic camera paired with an oracle that
//! replays face-analysis results from a trace file, one record per detection.
//!
//! The replay position is global to the daemon. Warm-up frames and photo
//! captures never reach the oracle and do not move it, but a new session
//! picks up where the previous one stopped, wrapping at the end of the trace.

use livecheck_core::trace::{self, TraceError, TraceRecord};
use livecheck_core::FaceObservation;
use std::path::Path;

use crate::vision::{FaceOracle, Frame, FrameSource, VisionError};

/// Frame source producing blank frames with increasing sequence numbers.
pub struct SyntheticCamera {
    next: u64,
    width: u32,
    height: u32,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            next: 0,
            width,
            height,
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn capture_frame(&mut self) -> Result<Frame, VisionError> {
        if self.width == 0 || self.height == 0 {
            return Err(VisionError::Source(format!(
                "invalid frame size {}x{}",
                self.width, self.height
            )));
        }
        let sequence = self.next;
        self.next += 1;
        Ok(Frame {
            data: vec![0u8; (self.width * self.height) as usize],
            width: self.width,
            height: self.height,
            sequence,
        })
    }
}

/// Oracle answering each detection with the next trace record, wrapping
/// around at the end of the trace. Frame contents are ignored.
pub struct ReplayOracle {
    records: Vec<TraceRecord>,
    position: usize,
}

impl ReplayOracle {
    pub fn new(records: Vec<TraceRecord>) -> Result<Self, TraceError> {
        if records.is_empty() {
            return Err(TraceError::Empty);
        }
        Ok(Self {
            records,
            position: 0,
        })
    }

    pub fn load(path: &Path) -> Result<Self, TraceError> {
        Self::new(trace::load_trace(path)?)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl FaceOracle for ReplayOracle {
    fn detect(&mut self, _frame: &Frame) -> Result<Option<FaceObservation>, VisionError> {
        let index = self.position;
        self.position = (self.position + 1) % self.records.len();
        match self.records[index].as_detection() {
            Ok(face) => Ok(face.cloned()),
            Err(message) => Err(VisionError::Oracle(message.to_string())),
        }
    }
}
