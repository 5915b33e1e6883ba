//! Challenge protocols and the ordered step sequences they require.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::machine::SessionId;
use crate::types::FacialState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("challenge sequence must contain at least one step")]
    EmptySequence,
    #[error("challenge step {index} requires unobservable state '{state}'")]
    UnobservableStep { index: usize, state: FacialState },
    #[error("unknown challenge protocol '{0}'")]
    UnknownProtocol(String),
    #[error("session {active} is still in progress; cancel it before starting a new one")]
    InvalidTransitionRequest { active: SessionId },
}

/// One required transition target within a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStep {
    RequireState(FacialState),
}

impl ChallengeStep {
    pub fn required_state(&self) -> FacialState {
        match self {
            Self::RequireState(state) => *state,
        }
    }
}

impl fmt::Display for ChallengeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.required_state().as_str())
    }
}

/// Ordered, non-empty list of steps defining one liveness protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSequence {
    steps: Vec<ChallengeStep>,
}

impl ChallengeSequence {
    /// Build a sequence, rejecting empty lists and steps that could never be
    /// satisfied (`Undetected` is never a positive observation).
    pub fn new(steps: Vec<ChallengeStep>) -> Result<Self, ChallengeError> {
        if steps.is_empty() {
            return Err(ChallengeError::EmptySequence);
        }
        if let Some(index) = steps
            .iter()
            .position(|s| s.required_state() == FacialState::Undetected)
        {
            return Err(ChallengeError::UnobservableStep {
                index,
                state: FacialState::Undetected,
            });
        }
        Ok(Self { steps })
    }

    pub fn from_states(states: &[FacialState]) -> Result<Self, ChallengeError> {
        Self::new(states.iter().copied().map(ChallengeStep::RequireState).collect())
    }

    pub fn steps(&self) -> &[ChallengeStep] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<ChallengeStep> {
        self.steps.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false: a sequence holds at least one step.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// How raw oracle output is interpreted for a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Facial expression scores.
    Expression,
    /// Head orientation derived from landmark geometry.
    Orientation,
}

/// The supported liveness protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    SmileNeutral,
    TurnLeftRightCenter,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::SmileNeutral, Protocol::TurnLeftRightCenter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmileNeutral => "smile-neutral",
            Self::TurnLeftRightCenter => "turn-left-right-center",
        }
    }

    pub fn signal_kind(&self) -> SignalKind {
        match self {
            Self::SmileNeutral => SignalKind::Expression,
            Self::TurnLeftRightCenter => SignalKind::Orientation,
        }
    }

    pub fn sequence(&self) -> ChallengeSequence {
        let steps = match self {
            Self::SmileNeutral => vec![
                ChallengeStep::RequireState(FacialState::Smiling),
                ChallengeStep::RequireState(FacialState::Neutral),
            ],
            Self::TurnLeftRightCenter => vec![
                ChallengeStep::RequireState(FacialState::TurnedLeft),
                ChallengeStep::RequireState(FacialState::TurnedRight),
                ChallengeStep::RequireState(FacialState::Center),
            ],
        };
        ChallengeSequence { steps }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "smile-neutral" | "smile" => Ok(Self::SmileNeutral),
            "turn-left-right-center" | "turn" => Ok(Self::TurnLeftRightCenter),
            _ => Err(ChallengeError::UnknownProtocol(s.to_string())),
        }
    }
}
