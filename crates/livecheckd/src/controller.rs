//! Session controller.
//!
//! A single task owns the [`LivenessStateMachine`], the [`Sampler`] and the
//! [`CaptureTrigger`]. Control requests, samples, capture results and the
//! timeout watchdog are all handled in one `select!` loop, so each
//! transition runs to completion before the next input is looked at.
//! Samples tagged with anything other than the active session are dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use livecheck_core::{
    ChallengeError, Classifier, FacialState, LivenessEvent, LivenessStateMachine, MachineConfig,
    Protocol, SessionId, SessionStatus, Thresholds,
};

use crate::capture::{CaptureOutcome, CaptureTrigger, CapturedPhoto};
use crate::sampler::{Sample, Sampler};
use crate::store::{SessionLog, SessionSummary};
use crate::vision::VisionHandle;

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error("controller task exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub sample_interval: Duration,
    pub thresholds: Thresholds,
    pub machine: MachineConfig,
    pub settle_delay: Duration,
}

/// Point-in-time view of the controller, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub session: Option<SessionId>,
    pub protocol: Option<Protocol>,
    pub cursor: usize,
    pub steps: usize,
    pub guidance: Option<FacialState>,
    /// Whether a sampling task is running.
    pub sampling: bool,
    pub photo_available: bool,
}

enum ControlRequest {
    Start {
        protocol: Protocol,
        reply: oneshot::Sender<Result<SessionId, ChallengeError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Reset {
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Photo {
        reply: oneshot::Sender<Option<CapturedPhoto>>,
    },
}

/// Clone-safe handle to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlRequest>,
    events: broadcast::Sender<LivenessEvent>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ControllerError::ChannelClosed)
    }

    /// Start a challenge. Rejected while another session is in progress.
    pub async fn start_challenge(&self, protocol: Protocol) -> Result<SessionId, ControllerError> {
        let result = self
            .request(|reply| ControlRequest::Start { protocol, reply })
            .await?;
        Ok(result?)
    }

    /// Cancel the session in progress. Returns whether one was running.
    /// Sampling has stopped by the time this returns.
    pub async fn cancel_challenge(&self) -> Result<bool, ControllerError> {
        self.request(|reply| ControlRequest::Cancel { reply }).await
    }

    /// Return to idle, cancelling if needed and discarding any photo.
    /// Returns whether there was a session to clear.
    pub async fn reset_challenge(&self) -> Result<bool, ControllerError> {
        self.request(|reply| ControlRequest::Reset { reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ControllerError> {
        self.request(|reply| ControlRequest::Status { reply }).await
    }

    /// Liveness photo of the last completed session, once captured.
    pub async fn captured_photo(&self) -> Result<Option<CapturedPhoto>, ControllerError> {
        self.request(|reply| ControlRequest::Photo { reply }).await
    }

    /// Subscribe to guidance and session events.
    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }
}

/// Spawn the controller task on the current runtime.
pub fn spawn_controller(
    settings: ControllerSettings,
    vision: VisionHandle,
    log: Option<SessionLog>,
) -> ControllerHandle {
    let (tx, control_rx) = mpsc::channel(8);
    let (sample_tx, sample_rx) = mpsc::channel(8);
    let (capture_tx, capture_rx) = mpsc::channel(2);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let controller = Controller {
        settings,
        machine: LivenessStateMachine::new(settings.machine),
        sampler: Sampler::new(),
        capture: CaptureTrigger::new(settings.settle_delay),
        vision,
        log,
        events: events.clone(),
        sample_tx,
        capture_tx,
        protocol: None,
        started_at: None,
        photo: None,
    };
    tokio::spawn(controller.run(control_rx, sample_rx, capture_rx));

    ControllerHandle { tx, events }
}

struct Controller {
    settings: ControllerSettings,
    machine: LivenessStateMachine,
    sampler: Sampler,
    capture: CaptureTrigger,
    vision: VisionHandle,
    log: Option<SessionLog>,
    events: broadcast::Sender<LivenessEvent>,
    sample_tx: mpsc::Sender<Sample>,
    capture_tx: mpsc::Sender<CaptureOutcome>,
    protocol: Option<Protocol>,
    started_at: Option<DateTime<Utc>>,
    photo: Option<CapturedPhoto>,
}

impl Controller {
    async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<ControlRequest>,
        mut sample_rx: mpsc::Receiver<Sample>,
        mut capture_rx: mpsc::Receiver<CaptureOutcome>,
    ) {
        let mut watchdog = tokio::time::interval(self.settings.sample_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("controller started");
        loop {
            tokio::select! {
                biased;

                req = control_rx.recv() => match req {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
                Some(sample) = sample_rx.recv() => self.handle_sample(sample).await,
                Some(outcome) = capture_rx.recv() => self.handle_capture(outcome),
                _ = watchdog.tick() => {
                    if let Some(event) = self.machine.check_timeout(Instant::now()) {
                        self.dispatch(event).await;
                    }
                }
            }
        }

        self.sampler.stop().await;
        self.capture.abort_pending();
        tracing::info!("controller exiting");
    }

    async fn handle_request(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Start { protocol, reply } => {
                let result = self.start(protocol).await;
                let _ = reply.send(result);
            }
            ControlRequest::Cancel { reply } => {
                let cancelled = self.cancel().await;
                let _ = reply.send(cancelled);
            }
            ControlRequest::Reset { reply } => {
                let had_session = self.machine.session().is_some();
                self.cancel().await;
                self.machine.reset();
                self.capture.abort_pending();
                self.protocol = None;
                self.started_at = None;
                self.photo = None;
                tracing::info!(had_session, "controller reset to idle");
                let _ = reply.send(had_session);
            }
            ControlRequest::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControlRequest::Photo { reply } => {
                let _ = reply.send(self.photo.clone());
            }
        }
    }

    async fn start(&mut self, protocol: Protocol) -> Result<SessionId, ChallengeError> {
        let event = self.machine.start(protocol.sequence(), Instant::now())?;
        let session = event.session();

        self.capture.abort_pending();
        self.photo = None;
        self.protocol = Some(protocol);
        self.started_at = Some(Utc::now());

        let classifier = Classifier::new(protocol, self.settings.thresholds);
        self.sampler
            .start(
                session,
                self.settings.sample_interval,
                classifier,
                self.vision.clone(),
                self.sample_tx.clone(),
            )
            .await;

        tracing::info!(session = %session, protocol = %protocol, "challenge started");
        self.dispatch(event).await;
        Ok(session)
    }

    async fn cancel(&mut self) -> bool {
        let event = self.machine.cancel();
        // Stop unconditionally so no tick can outlive the call.
        self.sampler.stop().await;
        match event {
            Some(event) => {
                self.dispatch(event).await;
                true
            }
            None => false,
        }
    }

    async fn handle_sample(&mut self, sample: Sample) {
        if self.machine.active_session() != Some(sample.session()) {
            tracing::trace!(session = %sample.session(), "stale sample dropped");
            return;
        }
        let event = match sample {
            Sample::Observed { observation, .. } => self.machine.observe(&observation),
            Sample::Unavailable { reason, at, .. } => self.machine.detection_unavailable(&reason, at),
        };
        if let Some(event) = event {
            self.dispatch(event).await;
        }
    }

    fn handle_capture(&mut self, outcome: CaptureOutcome) {
        let completed = self
            .machine
            .session()
            .filter(|s| s.status() == SessionStatus::Completed)
            .map(|s| s.id());
        if completed != Some(outcome.session) {
            tracing::debug!(session = %outcome.session, "capture for inactive session discarded");
            return;
        }

        match outcome.result {
            Ok(frame) => {
                tracing::info!(
                    session = %outcome.session,
                    frame = frame.sequence,
                    width = frame.width,
                    height = frame.height,
                    "liveness photo captured"
                );
                self.photo = Some(CapturedPhoto {
                    session: outcome.session,
                    frame,
                    captured_at: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(session = %outcome.session, error = %e, "liveness photo capture failed");
            }
        }
    }

    /// Apply the side effects of an event, then publish it.
    async fn dispatch(&mut self, event: LivenessEvent) {
        match &event {
            LivenessEvent::ChallengeCompleted { session } => {
                self.sampler.stop().await;
                self.capture
                    .fire(*session, self.vision.clone(), self.capture_tx.clone());
            }
            LivenessEvent::SessionReset { .. } => {
                self.sampler.stop().await;
                self.capture.abort_pending();
            }
            LivenessEvent::GuidanceChanged { .. } | LivenessEvent::DetectionUnavailable { .. } => {}
        }

        if event.ends_session() {
            self.record_outcome().await;
        }

        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    async fn record_outcome(&self) {
        let (Some(log), Some(session), Some(protocol), Some(started_at)) = (
            self.log.as_ref(),
            self.machine.session(),
            self.protocol,
            self.started_at,
        ) else {
            return;
        };

        let summary = SessionSummary {
            session: session.id(),
            protocol,
            outcome: session.status(),
            steps_satisfied: session.cursor(),
            steps_total: session.sequence().len(),
            started_at,
        };
        if let Err(e) = log.record(&summary).await {
            tracing::warn!(session = %summary.session, error = %e, "failed to record session outcome");
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let session = self.machine.session();
        StatusSnapshot {
            status: self.machine.status(),
            session: session.map(|s| s.id()),
            protocol: self.protocol,
            cursor: session.map_or(0, |s| s.cursor()),
            steps: session.map_or(0, |s| s.sequence().len()),
            guidance: self.machine.current_guidance().map(|s| s.required_state()),
            sampling: self.sampler.session().is_some(),
            photo_available: self.photo.is_some(),
        }
    }
}
