use tokio::sync::{broadcast, Mutex};
use zbus::interface;
use zbus::message::Header;
use zbus::object_server::SignalEmitter;

use livecheck_core::{LivenessEvent, Protocol, SessionStatus};

use crate::config::Config;
use crate::controller::{ControllerError, ControllerHandle};
use crate::store::{SessionLog, StoreError};

pub const BUS_NAME: &str = "org.freedesktop.Livecheck1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Livecheck1";

/// Maximum number of session records returned by `RecentSessions`.
const MAX_RECENT: u32 = 100;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub controller: ControllerHandle,
    pub log: SessionLog,
}

/// D-Bus interface for the liveness challenge daemon.
///
/// Bus name: org.freedesktop.Livecheck1
/// Object path: /org/freedesktop/Livecheck1
///
/// On the system bus, cancel, reset and photo retrieval are limited to the
/// UID that started the current session, and to root.
pub struct LivecheckService {
    state: AppState,
    /// UID of the caller that started the current session.
    owner_uid: Mutex<Option<u32>>,
}

impl LivecheckService {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            owner_uid: Mutex::new(None),
        }
    }

    /// UID of the calling peer, or `None` on the session bus where callers
    /// are not checked.
    async fn caller_uid(
        &self,
        header: &Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<Option<u32>> {
        if self.state.config.session_bus {
            return Ok(None);
        }
        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        get_caller_uid(sender.as_str(), conn).await.map(Some)
    }

    /// Reject callers that neither own the current session nor are root.
    async fn authorize(
        &self,
        action: &str,
        header: &Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let Some(caller_uid) = self.caller_uid(header, conn).await? else {
            return Ok(());
        };
        let owner_uid = *self.owner_uid.lock().await;
        if caller_permitted(caller_uid, owner_uid) {
            return Ok(());
        }
        tracing::warn!(action, caller_uid, ?owner_uid, "caller does not own the session");
        Err(zbus::fdo::Error::AccessDenied(format!(
            "caller is not permitted to {action} this session"
        )))
    }
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Root may act on any session; anyone else only on the one they started.
fn caller_permitted(caller_uid: u32, owner_uid: Option<u32>) -> bool {
    caller_uid == 0 || owner_uid == Some(caller_uid)
}

fn to_fdo(e: ControllerError) -> zbus::fdo::Error {
    match e {
        ControllerError::Challenge(e) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        ControllerError::ChannelClosed => zbus::fdo::Error::Failed(e.to_string()),
    }
}

/// Unwrap a session-log count for the status report, logging failures.
fn count_or_zero(result: Result<u64, StoreError>, what: &str) -> u64 {
    result.unwrap_or_else(|e| {
        tracing::warn!(what, error = %e, "failed to count logged sessions");
        0
    })
}

#[interface(name = "org.freedesktop.Livecheck1")]
impl LivecheckService {
    /// Start a liveness challenge. Returns the session id.
    ///
    /// `protocol` is `smile-neutral` or `turn-left-right-center`. Fails while
    /// another session is still in progress.
    async fn start_challenge(
        &self,
        protocol: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<u64> {
        tracing::info!(protocol, "start_challenge requested");
        let protocol: Protocol = protocol
            .parse()
            .map_err(|e: livecheck_core::ChallengeError| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let caller_uid = self.caller_uid(&header, conn).await?;

        // Held across the start so ownership changes with the session.
        let mut owner_uid = self.owner_uid.lock().await;
        let session = self
            .state
            .controller
            .start_challenge(protocol)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "start_challenge rejected");
                to_fdo(e)
            })?;
        *owner_uid = caller_uid;
        tracing::info!(session = %session, ?caller_uid, "challenge started");
        Ok(session.0)
    }

    /// Cancel the challenge in progress. Returns false if nothing was running.
    async fn cancel_challenge(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!("cancel_challenge requested");
        self.authorize("cancel", &header, conn).await?;
        self.state.controller.cancel_challenge().await.map_err(to_fdo)
    }

    /// Clear the current session (cancelling it if needed) and return to idle.
    async fn reset_challenge(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!("reset_challenge requested");
        self.authorize("reset", &header, conn).await?;
        let mut owner_uid = self.owner_uid.lock().await;
        let had_session = self.state.controller.reset_challenge().await.map_err(to_fdo)?;
        *owner_uid = None;
        Ok(had_session)
    }

    /// Return daemon and session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.state.controller.status().await.map_err(to_fdo)?;
        let log = &self.state.log;
        let sessions_logged = count_or_zero(log.count_all().await, "all");
        let mut outcomes = serde_json::Map::new();
        for outcome in [
            SessionStatus::Completed,
            SessionStatus::Expired,
            SessionStatus::Cancelled,
        ] {
            let count = count_or_zero(log.count_by_outcome(outcome).await, outcome.as_str());
            outcomes.insert(outcome.as_str().to_string(), count.into());
        }

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": snapshot,
            "sessions_logged": sessions_logged,
            "outcomes": outcomes,
            "sample_interval_ms": self.state.config.sample_interval_ms,
            "step_timeout_secs": self.state.config.step_timeout_secs,
            "debounce_samples": self.state.config.debounce_samples,
        })
        .to_string())
    }

    /// Return the liveness photo of the last completed session as
    /// `(session, captured_at, width, height, data)`, with `captured_at` in
    /// RFC 3339.
    async fn captured_photo(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<(u64, String, u32, u32, Vec<u8>)> {
        self.authorize("read the photo of", &header, conn).await?;
        let photo = self
            .state
            .controller
            .captured_photo()
            .await
            .map_err(to_fdo)?
            .ok_or_else(|| zbus::fdo::Error::Failed("no liveness photo available".to_string()))?;
        Ok((
            photo.session.0,
            photo.captured_at.to_rfc3339(),
            photo.frame.width,
            photo.frame.height,
            photo.frame.data,
        ))
    }

    /// List recently finished sessions as JSON, newest first.
    async fn recent_sessions(&self, limit: u32) -> zbus::fdo::Result<String> {
        let records = self
            .state
            .log
            .recent(limit.min(MAX_RECENT))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    #[zbus(signal)]
    async fn guidance_changed(
        emitter: &SignalEmitter<'_>,
        session: u64,
        step: &str,
        index: u32,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn challenge_completed(emitter: &SignalEmitter<'_>, session: u64) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn session_reset(
        emitter: &SignalEmitter<'_>,
        session: u64,
        reason: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn detection_unavailable(
        emitter: &SignalEmitter<'_>,
        session: u64,
        reason: &str,
    ) -> zbus::Result<()>;
}

/// Re-emit controller events as D-Bus signals until the controller exits.
pub async fn forward_events(
    conn: zbus::Connection,
    mut events: broadcast::Receiver<LivenessEvent>,
) -> zbus::Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, LivecheckService>(OBJECT_PATH)
        .await?;
    let emitter = iface.signal_emitter();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal forwarder lagged; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let result = match &event {
            LivenessEvent::GuidanceChanged {
                session,
                step,
                index,
            } => {
                LivecheckService::guidance_changed(
                    emitter,
                    session.0,
                    step.required_state().as_str(),
                    *index as u32,
                )
                .await
            }
            LivenessEvent::ChallengeCompleted { session } => {
                LivecheckService::challenge_completed(emitter, session.0).await
            }
            LivenessEvent::SessionReset { session, reason } => {
                LivecheckService::session_reset(emitter, session.0, reason.as_str()).await
            }
            LivenessEvent::DetectionUnavailable { session, reason } => {
                LivecheckService::detection_unavailable(emitter, session.0, reason).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }

    Ok(())
}
