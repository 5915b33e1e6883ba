use std::path::PathBuf;
use std::time::Duration;

use livecheck_core::{MachineConfig, Thresholds};

use crate::controller::ControllerSettings;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Recorded oracle trace replayed as the face-analysis backend.
    pub trace_path: Option<PathBuf>,
    /// Path to the SQLite session log.
    pub db_path: PathBuf,
    /// Interval between oracle samples, in milliseconds.
    pub sample_interval_ms: u64,
    /// Minimum detection confidence for orientation classification.
    pub min_confidence: f32,
    /// Expression score above which smile/neutral is recognised.
    pub expression_threshold: f32,
    /// `rx` above which the head counts as tilted up.
    pub tilt_threshold: f32,
    /// `|ry|` beyond which the head counts as turned.
    pub turn_threshold: f32,
    /// Seconds allowed for each challenge step before the session expires.
    pub step_timeout_secs: u64,
    /// Delay between challenge completion and the photo grab.
    pub settle_delay_ms: u64,
    /// Consecutive matching samples required to satisfy a step.
    pub debounce_samples: u32,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `LIVECHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("livecheck");

        let db_path = std::env::var("LIVECHECK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("sessions.db"));

        Self {
            trace_path: std::env::var("LIVECHECK_TRACE_PATH").ok().map(PathBuf::from),
            db_path,
            sample_interval_ms: env_u64("LIVECHECK_SAMPLE_INTERVAL_MS", 100).max(1),
            min_confidence: env_f32("LIVECHECK_MIN_CONFIDENCE", 0.3),
            expression_threshold: env_f32("LIVECHECK_EXPRESSION_THRESHOLD", 0.8),
            tilt_threshold: env_f32("LIVECHECK_TILT_THRESHOLD", 0.2),
            turn_threshold: env_f32("LIVECHECK_TURN_THRESHOLD", 0.04),
            step_timeout_secs: env_u64("LIVECHECK_STEP_TIMEOUT_SECS", 15),
            settle_delay_ms: env_u64("LIVECHECK_SETTLE_DELAY_MS", 1000),
            debounce_samples: env_u32("LIVECHECK_DEBOUNCE_SAMPLES", 1).max(1),
            warmup_frames: env_u64("LIVECHECK_WARMUP_FRAMES", 0) as usize,
            session_bus: std::env::var("LIVECHECK_SESSION_BUS").is_ok(),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            min_confidence: self.min_confidence,
            expression: self.expression_threshold,
            tilt: self.tilt_threshold,
            turn: self.turn_threshold,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            thresholds: self.thresholds(),
            machine: MachineConfig {
                debounce_samples: self.debounce_samples,
                max_step_duration: Duration::from_secs(self.step_timeout_secs),
            },
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
