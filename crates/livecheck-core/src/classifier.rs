//! Per-frame facial state classification.
//!
//! Maps a single oracle result to one [`FacialState`] using fixed thresholds.
//! Classification carries no history: an ambiguous frame is `Undetected` for
//! that instant and it is the state machine, not the classifier, that
//! tolerates gaps.
//!
//! # Orientation geometry
//!
//! Two signed ratios are derived from the landmark groups and the face box:
//!
//! - `rx = (top of jaw outline - mean mouth y) / box height + 0.5`. Grows as
//!   the mouth rises toward the jaw line, i.e. when the head tilts up.
//! - `ry = (midpoint between eye centres - mean nose x) / box width`. Negative
//!   when the nose sits right of the eye midpoint (head turned left in the
//!   subject's mirrored view), positive in the other direction.

use std::time::Instant;

use crate::challenge::{Protocol, SignalKind};
use crate::types::{FaceObservation, FacialState, Observation};

/// Default minimum detection confidence for orientation classification.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;
/// Default expression score above which an expression is considered shown.
pub const DEFAULT_EXPRESSION_THRESHOLD: f32 = 0.8;
/// Default `rx` above which the face is considered tilted up.
pub const DEFAULT_TILT_THRESHOLD: f32 = 0.2;
/// Default `|ry|` beyond which the head is considered turned.
pub const DEFAULT_TURN_THRESHOLD: f32 = 0.04;

/// Classification thresholds, exposed as tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_confidence: f32,
    pub expression: f32,
    pub tilt: f32,
    pub turn: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            expression: DEFAULT_EXPRESSION_THRESHOLD,
            tilt: DEFAULT_TILT_THRESHOLD,
            turn: DEFAULT_TURN_THRESHOLD,
        }
    }
}

/// Head orientation ratios derived from landmark geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub rx: f32,
    pub ry: f32,
}

/// Stateless classifier bound to one protocol's signal kind.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    kind: SignalKind,
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(protocol: Protocol, thresholds: Thresholds) -> Self {
        Self {
            kind: protocol.signal_kind(),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Classify one oracle result. `None` (no face) is always `Undetected`.
    pub fn classify(&self, face: Option<&FaceObservation>) -> FacialState {
        self.classify_scored(face).0
    }

    /// Classify and stamp an [`Observation`] with the score behind the label.
    pub fn observe(&self, face: Option<&FaceObservation>, timestamp: Instant) -> Observation {
        let (state, confidence) = self.classify_scored(face);
        Observation::new(state, confidence, timestamp)
    }

    fn classify_scored(&self, face: Option<&FaceObservation>) -> (FacialState, f32) {
        let Some(face) = face else {
            return (FacialState::Undetected, 0.0);
        };
        match self.kind {
            SignalKind::Expression => self.classify_expression(face),
            SignalKind::Orientation => self.classify_orientation(face),
        }
    }

    fn classify_expression(&self, face: &FaceObservation) -> (FacialState, f32) {
        let e = &face.expressions;
        if e.happy > self.thresholds.expression {
            (FacialState::Smiling, e.happy)
        } else if e.neutral > self.thresholds.expression {
            (FacialState::Neutral, e.neutral)
        } else {
            (FacialState::Undetected, 0.0)
        }
    }

    fn classify_orientation(&self, face: &FaceObservation) -> (FacialState, f32) {
        if !(face.confidence >= self.thresholds.min_confidence) {
            return (FacialState::Undetected, 0.0);
        }
        let Some(o) = orientation(face) else {
            return (FacialState::Undetected, 0.0);
        };

        // Tilted up: not a valid pose for any step.
        let state = if o.rx > self.thresholds.tilt {
            FacialState::Undetected
        } else if o.ry < -self.thresholds.turn {
            FacialState::TurnedLeft
        } else if o.ry > self.thresholds.turn {
            FacialState::TurnedRight
        } else {
            FacialState::Center
        };

        tracing::trace!(rx = o.rx, ry = o.ry, state = %state, "orientation classified");

        match state {
            FacialState::Undetected => (state, 0.0),
            _ => (state, face.confidence),
        }
    }
}

/// Compute orientation ratios, or `None` when the geometry is degenerate
/// (empty landmark group, non-positive box, non-finite result).
pub fn orientation(face: &FaceObservation) -> Option<Orientation> {
    let bbox = &face.bbox;
    if !(bbox.width > 0.0 && bbox.height > 0.0) {
        return None;
    }

    let lm = &face.landmarks;
    let left_eye = mean_point(&lm.left_eye)?;
    let right_eye = mean_point(&lm.right_eye)?;
    let nose = mean_point(&lm.nose)?;
    let mouth = mean_point(&lm.mouth)?;
    let jaw_top = lm
        .jaw_outline
        .iter()
        .map(|p| p.1)
        .min_by(|a, b| a.total_cmp(b))?;

    let rx = (jaw_top - mouth.1) / bbox.height + 0.5;
    let ry = (left_eye.0 + (right_eye.0 - left_eye.0) / 2.0 - nose.0) / bbox.width;

    if rx.is_finite() && ry.is_finite() {
        Some(Orientation { rx, ry })
    } else {
        None
    }
}

fn mean_point(points: &[(f32, f32)]) -> Option<(f32, f32)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), p| (ax + p.0, ay + p.1));
    Some((sx / n, sy / n))
}
