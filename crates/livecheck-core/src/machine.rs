//! Liveness challenge state machine.
//!
//! A session walks a single cursor over an explicit [`ChallengeSequence`].
//! Only the step under the cursor is ever compared against incoming
//! observations, so a session can never skip ahead, and the cursor never
//! moves backwards.
//!
//! ```text
//! Idle ──start──▶ InProgress ──last step──▶ Completed ─┐
//!                    │  ├──── step timeout ──▶ Expired ─┼──reset──▶ Idle
//!                    │  └──── cancel ────────▶ Cancelled┘
//!                    └─ Undetected / other states: hold
//! ```
//!
//! The machine is a plain value with no clock and no I/O: callers pass
//! timestamps in and receive events out. It is not internally synchronised;
//! a single owner applies observations one at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::challenge::{ChallengeError, ChallengeSequence, ChallengeStep};
use crate::types::{FacialState, Observation};

/// Default time a subject has to satisfy each step.
pub const DEFAULT_MAX_STEP_DURATION: Duration = Duration::from_secs(15);

/// Identifier of one challenge session, unique per state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    InProgress,
    Completed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// The current step was not satisfied within the allowed time.
    StepTimeout,
    /// The caller aborted the session.
    Cancelled,
}

impl ResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepTimeout => "step_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Output of the state machine, consumed by guidance renderers and the
/// capture trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LivenessEvent {
    /// The subject should now perform `step` (the `index`-th of the sequence).
    GuidanceChanged {
        session: SessionId,
        step: ChallengeStep,
        index: usize,
    },
    /// Every step was satisfied in order. Emitted at most once per session.
    ChallengeCompleted { session: SessionId },
    /// The session ended without completing; all guidance is cleared.
    SessionReset {
        session: SessionId,
        reason: ResetReason,
    },
    /// The oracle could not produce a result for this tick. The session is
    /// unaffected and resumes on the next successful sample.
    DetectionUnavailable { session: SessionId, reason: String },
}

impl LivenessEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::GuidanceChanged { session, .. }
            | Self::ChallengeCompleted { session }
            | Self::SessionReset { session, .. }
            | Self::DetectionUnavailable { session, .. } => *session,
        }
    }

    /// True for events after which the session no longer consumes samples.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Self::ChallengeCompleted { .. } | Self::SessionReset { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Consecutive matching samples required to satisfy a step (at least 1).
    pub debounce_samples: u32,
    /// Maximum time allowed between two advances (or start and the first).
    pub max_step_duration: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            debounce_samples: 1,
            max_step_duration: DEFAULT_MAX_STEP_DURATION,
        }
    }
}

/// One challenge run. Owned exclusively by [`LivenessStateMachine`].
#[derive(Debug, Clone)]
pub struct LivenessSession {
    id: SessionId,
    sequence: ChallengeSequence,
    cursor: usize,
    status: SessionStatus,
    started_at: Instant,
    last_advanced_at: Instant,
    /// Consecutive samples matching the step under the cursor.
    streak: u32,
    /// States that satisfied each step, in the order they were satisfied.
    satisfied: Vec<FacialState>,
}

impl LivenessSession {
    fn new(id: SessionId, sequence: ChallengeSequence, now: Instant) -> Self {
        let capacity = sequence.len();
        Self {
            id,
            sequence,
            cursor: 0,
            status: SessionStatus::InProgress,
            started_at: now,
            last_advanced_at: now,
            streak: 0,
            satisfied: Vec::with_capacity(capacity),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn sequence(&self) -> &ChallengeSequence {
        &self.sequence
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_advanced_at(&self) -> Instant {
        self.last_advanced_at
    }

    pub fn satisfied(&self) -> &[FacialState] {
        &self.satisfied
    }

    /// Step the subject is currently asked to perform, while in progress.
    pub fn current_step(&self) -> Option<ChallengeStep> {
        if self.status == SessionStatus::InProgress {
            self.sequence.get(self.cursor)
        } else {
            None
        }
    }

    fn expire_if_overdue(&mut self, max: Duration, now: Instant) -> Option<LivenessEvent> {
        let waited = now.saturating_duration_since(self.last_advanced_at);
        if waited <= max {
            return None;
        }
        self.status = SessionStatus::Expired;
        tracing::warn!(
            session = %self.id,
            cursor = self.cursor,
            waited_ms = waited.as_millis() as u64,
            "step timed out, session expired"
        );
        Some(LivenessEvent::SessionReset {
            session: self.id,
            reason: ResetReason::StepTimeout,
        })
    }
}

/// Drives one liveness session at a time.
#[derive(Debug)]
pub struct LivenessStateMachine {
    config: MachineConfig,
    session: Option<LivenessSession>,
    next_id: u64,
}

impl Default for LivenessStateMachine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl LivenessStateMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config: MachineConfig {
                debounce_samples: config.debounce_samples.max(1),
                ..config
            },
            session: None,
            next_id: 1,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&LivenessSession> {
        self.session.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(SessionStatus::Idle)
    }

    /// Id of the session currently consuming samples.
    pub fn active_session(&self) -> Option<SessionId> {
        self.session
            .as_ref()
            .filter(|s| s.status == SessionStatus::InProgress)
            .map(|s| s.id)
    }

    pub fn current_guidance(&self) -> Option<ChallengeStep> {
        self.session.as_ref().and_then(|s| s.current_step())
    }

    /// Begin a new session. Legal from `Idle` or any terminal state; a
    /// session still in progress is left untouched and the request rejected.
    pub fn start(
        &mut self,
        sequence: ChallengeSequence,
        now: Instant,
    ) -> Result<LivenessEvent, ChallengeError> {
        if let Some(active) = self.active_session() {
            tracing::warn!(session = %active, "start rejected: session already in progress");
            return Err(ChallengeError::InvalidTransitionRequest { active });
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let first = sequence.get(0).ok_or(ChallengeError::EmptySequence)?;
        tracing::info!(
            session = %id,
            steps = sequence.len(),
            first = %first,
            "challenge session started"
        );
        self.session = Some(LivenessSession::new(id, sequence, now));

        Ok(LivenessEvent::GuidanceChanged {
            session: id,
            step: first,
            index: 0,
        })
    }

    /// Apply one classified observation.
    ///
    /// Returns at most one event. Observations arriving while no session is
    /// in progress are ignored.
    pub fn observe(&mut self, observation: &Observation) -> Option<LivenessEvent> {
        let session = self.session.as_mut()?;
        if session.status != SessionStatus::InProgress {
            return None;
        }

        if let Some(event) =
            session.expire_if_overdue(self.config.max_step_duration, observation.timestamp)
        {
            return Some(event);
        }

        let required = session.sequence.get(session.cursor)?.required_state();
        if observation.state != required {
            if session.streak > 0 {
                tracing::debug!(
                    session = %session.id,
                    expected = %required,
                    observed = %observation.state,
                    streak = session.streak,
                    "streak broken"
                );
            }
            session.streak = 0;
            return None;
        }

        session.streak += 1;
        if session.streak < self.config.debounce_samples {
            tracing::trace!(
                session = %session.id,
                state = %required,
                streak = session.streak,
                "debouncing"
            );
            return None;
        }

        session.streak = 0;
        session.cursor += 1;
        session.satisfied.push(observation.state);
        session.last_advanced_at = observation.timestamp;

        tracing::info!(
            session = %session.id,
            satisfied = %required,
            confidence = observation.confidence,
            cursor = session.cursor,
            "challenge step satisfied"
        );

        match session.sequence.get(session.cursor) {
            Some(step) => Some(LivenessEvent::GuidanceChanged {
                session: session.id,
                step,
                index: session.cursor,
            }),
            None => {
                session.status = SessionStatus::Completed;
                tracing::info!(session = %session.id, "challenge completed");
                Some(LivenessEvent::ChallengeCompleted {
                    session: session.id,
                })
            }
        }
    }

    /// Report that the oracle failed for this tick. Never advances or fails
    /// the session by itself; only the step timeout can end it.
    pub fn detection_unavailable(&mut self, reason: &str, now: Instant) -> Option<LivenessEvent> {
        let session = self.session.as_mut()?;
        if session.status != SessionStatus::InProgress {
            return None;
        }
        if let Some(event) = session.expire_if_overdue(self.config.max_step_duration, now) {
            return Some(event);
        }
        session.streak = 0;
        tracing::debug!(session = %session.id, reason, "detection unavailable");
        Some(LivenessEvent::DetectionUnavailable {
            session: session.id,
            reason: reason.to_string(),
        })
    }

    /// Expire the active session if its current step has run out of time.
    pub fn check_timeout(&mut self, now: Instant) -> Option<LivenessEvent> {
        let session = self.session.as_mut()?;
        if session.status != SessionStatus::InProgress {
            return None;
        }
        session.expire_if_overdue(self.config.max_step_duration, now)
    }

    /// Abort the session in progress. No-op otherwise.
    pub fn cancel(&mut self) -> Option<LivenessEvent> {
        let session = self.session.as_mut()?;
        if session.status != SessionStatus::InProgress {
            return None;
        }
        session.status = SessionStatus::Cancelled;
        tracing::info!(session = %session.id, cursor = session.cursor, "challenge cancelled");
        Some(LivenessEvent::SessionReset {
            session: session.id,
            reason: ResetReason::Cancelled,
        })
    }

    /// Return to `Idle`, discarding the session and all of its step state.
    /// A session still in progress is cancelled first.
    pub fn reset(&mut self) -> Option<LivenessEvent> {
        let event = self.cancel();
        if let Some(session) = self.session.take() {
            tracing::debug!(session = %session.id, status = %session.status, "session cleared");
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::Protocol;
    use proptest::prelude::*;

    const TICK: Duration = Duration::from_millis(100);

    fn obs(state: FacialState, confidence: f32, at: Instant) -> Observation {
        Observation::new(state, confidence, at)
    }

    /// Feed states one tick apart starting one tick after `base`.
    fn feed(
        m: &mut LivenessStateMachine,
        base: Instant,
        states: &[FacialState],
    ) -> Vec<Option<LivenessEvent>> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| m.observe(&obs(*s, 0.9, base + TICK * (i as u32 + 1))))
            .collect()
    }

    fn guidance_state(event: &LivenessEvent) -> Option<FacialState> {
        match event {
            LivenessEvent::GuidanceChanged { step, .. } => Some(step.required_state()),
            _ => None,
        }
    }

    #[test]
    fn test_start_emits_first_guidance() {
        let mut m = LivenessStateMachine::default();
        let now = Instant::now();
        let ev = m.start(Protocol::SmileNeutral.sequence(), now).unwrap();
        assert_eq!(guidance_state(&ev), Some(FacialState::Smiling));
        assert_eq!(m.status(), SessionStatus::InProgress);
        assert_eq!(m.session().unwrap().cursor(), 0);
    }

    #[test]
    fn test_smile_neutral_scenario() {
        use FacialState::*;
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();

        let e1 = m.observe(&obs(Undetected, 0.0, t0 + TICK));
        let e2 = m.observe(&obs(Smiling, 0.9, t0 + TICK * 2));
        let e3 = m.observe(&obs(Undetected, 0.0, t0 + TICK * 3));
        let e4 = m.observe(&obs(Neutral, 0.85, t0 + TICK * 4));

        assert!(e1.is_none());
        assert_eq!(guidance_state(e2.as_ref().unwrap()), Some(Neutral));
        assert!(e3.is_none());
        assert!(matches!(e4, Some(LivenessEvent::ChallengeCompleted { .. })));
        assert_eq!(m.status(), SessionStatus::Completed);
        assert_eq!(m.session().unwrap().satisfied(), &[Smiling, Neutral]);
    }

    #[test]
    fn test_turn_scenario_rejects_wrong_order() {
        use FacialState::*;
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(Protocol::TurnLeftRightCenter.sequence(), t0).unwrap();

        let events = feed(&mut m, t0, &[TurnedRight, TurnedLeft, TurnedRight, Center]);

        assert!(events[0].is_none(), "wrong-order sample must not advance");
        assert_eq!(guidance_state(events[1].as_ref().unwrap()), Some(TurnedRight));
        assert_eq!(guidance_state(events[2].as_ref().unwrap()), Some(Center));
        assert!(matches!(
            events[3],
            Some(LivenessEvent::ChallengeCompleted { .. })
        ));
    }

    #[test]
    fn test_later_step_never_skipped_to() {
        use FacialState::*;
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(Protocol::TurnLeftRightCenter.sequence(), t0).unwrap();

        let events = feed(&mut m, t0, &[Center, TurnedRight, Center]);
        assert!(events.iter().all(Option::is_none));
        assert_eq!(m.session().unwrap().cursor(), 0);
    }

    #[test]
    fn test_completion_is_idempotent() {
        use FacialState::*;
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        feed(&mut m, t0, &[Smiling, Neutral]);
        assert_eq!(m.status(), SessionStatus::Completed);

        let later = feed(&mut m, t0 + TICK * 2, &[Smiling, Neutral, Neutral]);
        assert!(later.iter().all(Option::is_none));
        assert_eq!(m.session().unwrap().cursor(), 2);
        // A completed session never times out either.
        assert!(m.check_timeout(t0 + Duration::from_secs(3600)).is_none());
    }

    #[test]
    fn test_timeout_expires_once() {
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 1,
            max_step_duration: Duration::from_secs(2),
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();

        let mut resets = 0;
        for i in 1..=40u32 {
            if let Some(ev) = m.observe(&Observation::undetected(t0 + TICK * i)) {
                assert_eq!(
                    ev,
                    LivenessEvent::SessionReset {
                        session: SessionId(1),
                        reason: ResetReason::StepTimeout
                    }
                );
                assert!(TICK * i > Duration::from_secs(2));
                resets += 1;
            }
        }
        assert_eq!(resets, 1);
        assert_eq!(m.status(), SessionStatus::Expired);
        assert!(m.current_guidance().is_none());
    }

    #[test]
    fn test_timeout_boundary_is_exclusive() {
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 1,
            max_step_duration: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        assert!(m.check_timeout(t0 + Duration::from_secs(1)).is_none());
        assert!(m.check_timeout(t0 + Duration::from_millis(1001)).is_some());
    }

    #[test]
    fn test_timeout_measured_from_last_advance() {
        use FacialState::*;
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 1,
            max_step_duration: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        m.observe(&obs(Smiling, 0.9, t0 + Duration::from_millis(900)));
        // 1.8s after start but only 0.9s after the advance.
        assert!(m
            .observe(&Observation::undetected(t0 + Duration::from_millis(1800)))
            .is_none());
        assert_eq!(m.status(), SessionStatus::InProgress);
    }

    #[test]
    fn test_start_while_in_progress_rejected() {
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        m.observe(&obs(FacialState::Smiling, 0.9, t0 + TICK));

        let err = m
            .start(Protocol::TurnLeftRightCenter.sequence(), t0 + TICK * 2)
            .unwrap_err();
        assert_eq!(
            err,
            ChallengeError::InvalidTransitionRequest {
                active: SessionId(1)
            }
        );
        let s = m.session().unwrap();
        assert_eq!(s.id(), SessionId(1));
        assert_eq!(s.cursor(), 1);
        assert_eq!(m.current_guidance().unwrap().required_state(), FacialState::Neutral);
    }

    #[test]
    fn test_cancel_and_restart_is_isolated() {
        use FacialState::*;
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 2,
            ..MachineConfig::default()
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        feed(&mut m, t0, &[Smiling, Smiling, Neutral]);
        assert_eq!(m.session().unwrap().cursor(), 1);

        let ev = m.cancel().unwrap();
        assert_eq!(
            ev,
            LivenessEvent::SessionReset {
                session: SessionId(1),
                reason: ResetReason::Cancelled
            }
        );
        assert!(m.current_guidance().is_none());
        assert!(m.cancel().is_none());

        let ev = m.start(Protocol::SmileNeutral.sequence(), t0 + TICK * 10).unwrap();
        assert_eq!(ev.session(), SessionId(2));
        let s = m.session().unwrap();
        assert_eq!(s.cursor(), 0);
        assert!(s.satisfied().is_empty());

        // The half-built neutral streak from session 1 must not carry over.
        let e = m.observe(&obs(Neutral, 0.9, t0 + TICK * 11));
        assert!(e.is_none());
        let e = m.observe(&obs(Smiling, 0.9, t0 + TICK * 12));
        assert!(e.is_none(), "one sample is not enough with debounce 2");
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        assert!(m.reset().is_none());

        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();
        let ev = m.reset();
        assert!(matches!(
            ev,
            Some(LivenessEvent::SessionReset {
                reason: ResetReason::Cancelled,
                ..
            })
        ));
        assert_eq!(m.status(), SessionStatus::Idle);
        assert!(m.session().is_none());
        assert!(m.observe(&obs(FacialState::Smiling, 0.9, t0 + TICK)).is_none());
    }

    #[test]
    fn test_debounce_requires_consecutive_samples() {
        use FacialState::*;
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 3,
            ..MachineConfig::default()
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();

        let events = feed(
            &mut m,
            t0,
            &[Smiling, Smiling, Undetected, Smiling, Smiling, Smiling],
        );
        assert!(events[..5].iter().all(Option::is_none));
        assert_eq!(guidance_state(events[5].as_ref().unwrap()), Some(Neutral));
    }

    #[test]
    fn test_zero_debounce_treated_as_one() {
        let m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 0,
            ..MachineConfig::default()
        });
        assert_eq!(m.config().debounce_samples, 1);
    }

    #[test]
    fn test_detection_unavailable_holds_session() {
        use FacialState::*;
        let mut m = LivenessStateMachine::new(MachineConfig {
            debounce_samples: 1,
            max_step_duration: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        m.start(Protocol::SmileNeutral.sequence(), t0).unwrap();

        let ev = m.detection_unavailable("model not ready", t0 + TICK).unwrap();
        assert!(matches!(ev, LivenessEvent::DetectionUnavailable { .. }));
        assert_eq!(m.status(), SessionStatus::InProgress);

        let ev = m.observe(&obs(Smiling, 0.9, t0 + TICK * 2)).unwrap();
        assert_eq!(guidance_state(&ev), Some(Neutral));

        let ev = m
            .detection_unavailable("frame decode failed", t0 + TICK * 2 + Duration::from_secs(2))
            .unwrap();
        assert!(matches!(
            ev,
            LivenessEvent::SessionReset {
                reason: ResetReason::StepTimeout,
                ..
            }
        ));
    }

    #[test]
    fn test_custom_sequence() {
        use FacialState::*;
        let seq = ChallengeSequence::from_states(&[Smiling, Neutral, Smiling]).unwrap();
        let mut m = LivenessStateMachine::default();
        let t0 = Instant::now();
        m.start(seq, t0).unwrap();
        let events = feed(&mut m, t0, &[Smiling, Smiling, Neutral, Neutral, Smiling]);
        assert!(events[1].is_none());
        assert!(events[3].is_none());
        assert!(matches!(
            events[4],
            Some(LivenessEvent::ChallengeCompleted { .. })
        ));
        assert_eq!(m.session().unwrap().satisfied(), &[Smiling, Neutral, Smiling]);
    }

    fn any_state() -> impl Strategy<Value = FacialState> {
        prop_oneof![
            Just(FacialState::Undetected),
            Just(FacialState::Neutral),
            Just(FacialState::Smiling),
            Just(FacialState::TurnedLeft),
            Just(FacialState::TurnedRight),
            Just(FacialState::Center),
        ]
    }

    fn any_protocol() -> impl Strategy<Value = Protocol> {
        prop_oneof![Just(Protocol::SmileNeutral), Just(Protocol::TurnLeftRightCenter)]
    }

    proptest! {
        #[test]
        fn prop_cursor_monotonic_and_order_exact(
            protocol in any_protocol(),
            debounce in 1u32..4,
            states in proptest::collection::vec(any_state(), 0..80),
        ) {
            let mut m = LivenessStateMachine::new(MachineConfig {
                debounce_samples: debounce,
                max_step_duration: Duration::from_secs(3600),
            });
            let t0 = Instant::now();
            let sequence = protocol.sequence();
            let required: Vec<FacialState> =
                sequence.steps().iter().map(|s| s.required_state()).collect();
            m.start(sequence, t0).unwrap();

            let mut last_cursor = 0;
            let mut completions = 0;
            for (i, s) in states.iter().enumerate() {
                let ev = m.observe(&obs(*s, 0.9, t0 + TICK * (i as u32 + 1)));
                if matches!(ev, Some(LivenessEvent::ChallengeCompleted { .. })) {
                    completions += 1;
                }
                let session = m.session().unwrap();
                prop_assert!(session.cursor() >= last_cursor);
                prop_assert!(session.cursor() - last_cursor <= 1);
                last_cursor = session.cursor();
                prop_assert_eq!(session.satisfied(), &required[..session.cursor()]);
            }

            prop_assert!(completions <= 1);
            if m.status() == SessionStatus::Completed {
                prop_assert_eq!(completions, 1);
                prop_assert_eq!(m.session().unwrap().satisfied(), &required[..]);
            }
        }

        #[test]
        fn prop_undetected_never_regresses_or_expires_early(
            prefix in proptest::collection::vec(any_state(), 0..10),
            gaps in proptest::collection::vec(1u64..500, 1..40),
        ) {
            let max = Duration::from_secs(5);
            let mut m = LivenessStateMachine::new(MachineConfig {
                debounce_samples: 1,
                max_step_duration: max,
            });
            let t0 = Instant::now();
            m.start(Protocol::TurnLeftRightCenter.sequence(), t0).unwrap();

            let mut t = t0;
            for s in &prefix {
                t += TICK;
                m.observe(&obs(*s, 0.9, t));
            }
            prop_assume!(m.status() == SessionStatus::InProgress);

            let cursor = m.session().unwrap().cursor();
            let anchor = m.session().unwrap().last_advanced_at();
            for gap in gaps {
                t += Duration::from_millis(gap);
                let ev = m.observe(&Observation::undetected(t));
                prop_assert_eq!(m.session().unwrap().cursor(), cursor);
                let elapsed = t.saturating_duration_since(anchor);
                match ev {
                    None => prop_assert!(elapsed <= max),
                    Some(LivenessEvent::SessionReset { reason: ResetReason::StepTimeout, .. }) => {
                        prop_assert!(elapsed > max);
                        break;
                    }
                    Some(other) => prop_assert!(false, "unexpected event {:?}", other),
                }
            }
        }
    }
}
