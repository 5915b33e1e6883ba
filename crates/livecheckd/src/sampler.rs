//! Periodic observation sampler.
//!
//! At most one sampling task exists per [`Sampler`]. Each tick grabs a frame,
//! runs the oracle on the vision thread, classifies the result and forwards
//! it tagged with the session it was taken for. Ticks missed while the
//! oracle is busy are skipped, never queued.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use livecheck_core::{Classifier, Observation, SessionId};

use crate::vision::VisionHandle;

/// One sampler output, tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub enum Sample {
    Observed {
        session: SessionId,
        observation: Observation,
    },
    Unavailable {
        session: SessionId,
        reason: String,
        at: Instant,
    },
}

impl Sample {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Observed { session, .. } | Self::Unavailable { session, .. } => *session,
        }
    }
}

struct SamplerTask {
    session: SessionId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct Sampler {
    task: Option<SamplerTask>,
}

impl Sampler {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Session currently being sampled, if any.
    pub fn session(&self) -> Option<SessionId> {
        self.task.as_ref().map(|t| t.session)
    }

    /// Start sampling for `session`, stopping any previous task first.
    pub async fn start(
        &mut self,
        session: SessionId,
        interval: Duration,
        classifier: Classifier,
        vision: VisionHandle,
        out: mpsc::Sender<Sample>,
    ) {
        self.stop().await;

        tracing::debug!(session = %session, interval_ms = interval.as_millis() as u64, "sampler starting");
        let handle = tokio::spawn(run(session, interval, classifier, vision, out));
        self.task = Some(SamplerTask { session, handle });
    }

    /// Stop sampling. Idempotent. Once this returns the task has finished and
    /// will produce no further samples.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.handle.abort();
        // Joining an aborted task waits until it has actually been dropped.
        let _ = task.handle.await;
        tracing::debug!(session = %task.session, "sampler stopped");
    }
}

async fn run(
    session: SessionId,
    interval: Duration,
    classifier: Classifier,
    vision: VisionHandle,
    out: mpsc::Sender<Sample>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let tick = ticker.tick().await;

        let result = vision.detect().await;
        let at = Instant::now();
        let latency = tick.elapsed();
        if latency > interval {
            tracing::debug!(
                session = %session,
                latency_ms = latency.as_millis() as u64,
                "oracle slower than sampling interval; skipping missed ticks"
            );
        }

        let sample = match result {
            Ok(face) => {
                let observation = classifier.observe(face.as_ref(), at);
                tracing::trace!(
                    session = %session,
                    state = %observation.state,
                    confidence = observation.confidence,
                    "sample"
                );
                Sample::Observed {
                    session,
                    observation,
                }
            }
            Err(e) => {
                tracing::warn!(session = %session, error = %e, "detection unavailable");
                Sample::Unavailable {
                    session,
                    reason: e.to_string(),
                    at,
                }
            }
        };

        if out.send(sample).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::testing::{expression_face, scripted_vision};
    use livecheck_core::{FacialState, Protocol, Thresholds};

    fn classifier() -> Classifier {
        Classifier::new(Protocol::SmileNeutral, Thresholds::default())
    }

    #[tokio::test]
    async fn test_samples_are_classified_and_tagged() {
        let (vision, _script, _calls) = scripted_vision(
            vec![
                Ok(None),
                Ok(Some(expression_face(0.9, 0.0))),
                Err("decode failed".into()),
            ],
            Duration::ZERO,
        );
        let (tx, mut rx) = mpsc::channel(16);
        let mut sampler = Sampler::new();
        sampler
            .start(SessionId(7), Duration::from_millis(5), classifier(), vision, tx)
            .await;
        assert_eq!(sampler.session(), Some(SessionId(7)));

        let s1 = rx.recv().await.unwrap();
        let s2 = rx.recv().await.unwrap();
        let s3 = rx.recv().await.unwrap();
        sampler.stop().await;

        assert!(matches!(
            s1,
            Sample::Observed { observation, .. } if observation.state == FacialState::Undetected
        ));
        assert!(matches!(
            s2,
            Sample::Observed { observation, .. } if observation.state == FacialState::Smiling
        ));
        assert!(matches!(s3, Sample::Unavailable { .. }));
        assert!([s1, s2, s3].iter().all(|s| s.session() == SessionId(7)));
    }

    #[tokio::test]
    async fn test_stop_halts_production() {
        let (vision, _script, calls) = scripted_vision(vec![], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(64);
        let mut sampler = Sampler::new();
        sampler
            .start(SessionId(1), Duration::from_millis(5), classifier(), vision, tx)
            .await;
        rx.recv().await.unwrap();

        sampler.stop().await;
        sampler.stop().await;
        assert_eq!(sampler.session(), None);

        // A request already queued on the vision thread may still be served,
        // but its reply has nowhere to go.
        tokio::time::sleep(Duration::from_millis(20)).await;
        while rx.try_recv().is_ok() {}
        let before = *calls.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(*calls.lock().unwrap(), before);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_task() {
        let (vision, _script, _calls) = scripted_vision(vec![], Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(64);
        let mut sampler = Sampler::new();
        sampler
            .start(SessionId(1), Duration::from_millis(5), classifier(), vision.clone(), tx.clone())
            .await;
        rx.recv().await.unwrap();

        sampler
            .start(SessionId(2), Duration::from_millis(5), classifier(), vision, tx)
            .await;
        while let Ok(s) = rx.try_recv() {
            assert_eq!(s.session(), SessionId(1));
        }
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().session(), SessionId(2));
        }
        sampler.stop().await;
    }

    #[tokio::test]
    async fn test_slow_oracle_skips_ticks() {
        // 30ms oracle against a 5ms interval: no backlog may build up.
        let (vision, _script, calls) = scripted_vision(vec![], Duration::from_millis(30));
        let (tx, mut rx) = mpsc::channel(64);
        let mut sampler = Sampler::new();
        sampler
            .start(SessionId(1), Duration::from_millis(5), classifier(), vision, tx)
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        sampler.stop().await;

        let mut produced = 0;
        while rx.try_recv().is_ok() {
            produced += 1;
        }
        // At most one oracle call in flight at a time: ~200/30 calls, not ~200/5.
        let calls = *calls.lock().unwrap();
        assert!(calls <= 9, "oracle called {calls} times");
        assert!(produced as u64 <= calls);
    }
}
