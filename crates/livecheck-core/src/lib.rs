//! livecheck-core: active liveness challenge engine.
//!
//! Classifies raw face-analysis output into discrete facial states and drives
//! a challenge session through an ordered sequence of required states
//! (smile then neutral, or turn left, right, then back to center).

pub mod challenge;
pub mod classifier;
pub mod machine;
pub mod trace;
pub mod types;

pub use challenge::{ChallengeError, ChallengeSequence, ChallengeStep, Protocol};
pub use classifier::{Classifier, Thresholds};
pub use machine::{
    LivenessEvent, LivenessSession, LivenessStateMachine, MachineConfig, ResetReason,
    SessionId, SessionStatus,
};
pub use types::{BoundingBox, Expressions, FaceObservation, FacialState, Landmarks, Observation};
