use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use livecheck_core::SessionId;

use crate::vision::{Frame, VisionError, VisionHandle};

/// The accepted liveness photo for a completed session.
#[derive(Debug, Clone)]
pub struct CapturedPhoto {
    pub session: SessionId,
    pub frame: Frame,
    pub captured_at: DateTime<Utc>,
}

/// Result of one capture attempt, delivered back to the controller.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub session: SessionId,
    pub result: Result<Frame, VisionError>,
}

/// Grabs exactly one frame per completed session, after a settle delay that
/// lets the final pose stabilise.
pub struct CaptureTrigger {
    settle_delay: Duration,
    fired_for: Option<SessionId>,
    pending: Option<JoinHandle<()>>,
}

impl CaptureTrigger {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            settle_delay,
            fired_for: None,
            pending: None,
        }
    }

    /// Schedule the capture for `session`. Returns `false` (and does nothing)
    /// if a capture was already scheduled for this session.
    pub fn fire(
        &mut self,
        session: SessionId,
        vision: VisionHandle,
        out: mpsc::Sender<CaptureOutcome>,
    ) -> bool {
        if self.fired_for == Some(session) {
            tracing::warn!(session = %session, "duplicate capture request ignored");
            return false;
        }
        self.abort_pending();
        self.fired_for = Some(session);

        let settle = self.settle_delay;
        tracing::info!(
            session = %session,
            settle_ms = settle.as_millis() as u64,
            "capture scheduled"
        );
        self.pending = Some(tokio::spawn(async move {
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            let result = vision.capture().await;
            let _ = out.send(CaptureOutcome { session, result }).await;
        }));
        true
    }

    /// Abort a capture still waiting out its settle delay. The session stays
    /// marked as fired, so it cannot be captured later.
    pub fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            if !handle.is_finished() {
                tracing::debug!(session = ?self.fired_for, "pending capture aborted");
            }
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::testing::scripted_vision;

    #[tokio::test]
    async fn test_fires_once_per_session() {
        let (vision, _script, _calls) = scripted_vision(vec![], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(4);
        let mut trigger = CaptureTrigger::new(Duration::from_millis(10));

        assert!(trigger.fire(SessionId(1), vision.clone(), tx.clone()));
        assert!(!trigger.fire(SessionId(1), vision.clone(), tx.clone()));

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.session, SessionId(1));
        assert!(outcome.result.is_ok());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        // A later session is captured independently.
        assert!(trigger.fire(SessionId(2), vision, tx));
        assert_eq!(rx.recv().await.unwrap().session, SessionId(2));
    }

    #[tokio::test]
    async fn test_abort_during_settle_delay() {
        let (vision, _script, _calls) = scripted_vision(vec![], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(4);
        let mut trigger = CaptureTrigger::new(Duration::from_millis(50));

        assert!(trigger.fire(SessionId(1), vision.clone(), tx.clone()));
        trigger.abort_pending();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // Still counts as fired for that session.
        assert!(!trigger.fire(SessionId(1), vision, tx));
    }
}
