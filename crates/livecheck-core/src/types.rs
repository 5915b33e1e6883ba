use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Discrete facial state observed at one sampled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacialState {
    /// No face, low confidence, or an ambiguous frame.
    Undetected,
    Neutral,
    Smiling,
    TurnedLeft,
    TurnedRight,
    Center,
}

impl FacialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undetected => "undetected",
            Self::Neutral => "neutral",
            Self::Smiling => "smiling",
            Self::TurnedLeft => "turned_left",
            Self::TurnedRight => "turned_right",
            Self::Center => "center",
        }
    }
}

impl fmt::Display for FacialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Per-expression probabilities reported by the face-analysis oracle.
///
/// Missing fields deserialize to 0.0 so traces only need to carry the
/// scores the classifier reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

/// Facial landmark groups, each a list of `(x, y)` points in frame pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Landmarks {
    pub jaw_outline: Vec<(f32, f32)>,
    pub left_eye: Vec<(f32, f32)>,
    pub right_eye: Vec<(f32, f32)>,
    pub nose: Vec<(f32, f32)>,
    pub mouth: Vec<(f32, f32)>,
}

/// One face as reported by the oracle for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    /// Detection confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub expressions: Expressions,
    #[serde(default)]
    pub landmarks: Landmarks,
}

/// A classified sample. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub state: FacialState,
    /// Score that justified `state` (0.0 when undetected).
    pub confidence: f32,
    pub timestamp: Instant,
}

impl Observation {
    pub fn new(state: FacialState, confidence: f32, timestamp: Instant) -> Self {
        Self {
            state,
            confidence,
            timestamp,
        }
    }

    pub fn undetected(timestamp: Instant) -> Self {
        Self::new(FacialState::Undetected, 0.0, timestamp)
    }
}
