use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod controller;
mod dbus_interface;
mod replay;
mod sampler;
mod store;
mod vision;

use crate::config::Config;
use crate::dbus_interface::{AppState, LivecheckService, BUS_NAME, OBJECT_PATH};
use crate::replay::{ReplayOracle, SyntheticCamera};
use crate::store::SessionLog;

/// Frame size reported by the synthetic camera.
const REPLAY_FRAME_SIZE: (u32, u32) = (320, 240);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("livecheckd starting");

    let config = Config::from_env();

    // Fail fast if the frame source or oracle is unavailable
    let trace_path = config
        .trace_path
        .clone()
        .context("LIVECHECK_TRACE_PATH is not set; no face analysis backend configured")?;
    let oracle = ReplayOracle::load(&trace_path)
        .with_context(|| format!("failed to load trace {}", trace_path.display()))?;
    tracing::info!(path = %trace_path.display(), records = oracle.len(), "replay oracle loaded");

    let camera = SyntheticCamera::new(REPLAY_FRAME_SIZE.0, REPLAY_FRAME_SIZE.1);
    let vision = vision::spawn_vision(camera, oracle, config.warmup_frames)?;

    let log = SessionLog::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open session log {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "session log opened");

    let controller =
        controller::spawn_controller(config.controller_settings(), vision, Some(log.clone()));
    let events = controller.subscribe();

    let builder = if config.session_bus {
        tracing::warn!("running on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };

    let service = LivecheckService::new(AppState {
        config,
        controller: controller.clone(),
        log,
    });
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let forwarder = tokio::spawn(dbus_interface::forward_events(conn.clone(), events));

    tracing::info!(bus_name = BUS_NAME, "livecheckd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("livecheckd shutting down");

    controller.reset_challenge().await.ok();
    forwarder.abort();

    Ok(())
}
