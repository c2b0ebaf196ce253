use std::env;
use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drift tolerated on an incoming `play` before we bother seeking
pub const DRIFT_TOLERANCE_SECS: f64 = 2.0;
/// Window after applying a remote command in which local player events are echoes
pub const SUPPRESSION_GRACE_MS: u64 = 500;
/// Wait after a freshly loaded program reports ready before writing its position
pub const SETTLE_DELAY_MS: u64 = 800;
/// Wait after joining before asking the room for its state
pub const BOOTSTRAP_DELAY_MS: u64 = 1500;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);
/// How long the simulated player takes to load a program
pub const SIMULATED_LOAD_LATENCY: Duration = Duration::from_millis(300);

/// Timing knobs of the sync engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncTimings {
    pub drift_tolerance_secs: f64,
    pub suppression_grace: Duration,
    pub settle_delay: Duration,
    pub bootstrap_delay: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            drift_tolerance_secs: DRIFT_TOLERANCE_SECS,
            suppression_grace: Duration::from_millis(SUPPRESSION_GRACE_MS),
            settle_delay: Duration::from_millis(SETTLE_DELAY_MS),
            bootstrap_delay: Duration::from_millis(BOOTSTRAP_DELAY_MS),
        }
    }
}

impl SyncTimings {
    /// Defaults, overridden by `PARTY_*` environment variables when set and valid
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            drift_tolerance_secs: lookup("PARTY_DRIFT_TOLERANCE_SECS")
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value >= 0.0)
                .unwrap_or(defaults.drift_tolerance_secs),
            suppression_grace: millis("PARTY_SUPPRESSION_GRACE_MS", defaults.suppression_grace),
            settle_delay: millis("PARTY_SETTLE_DELAY_MS", defaults.settle_delay),
            bootstrap_delay: millis("PARTY_BOOTSTRAP_DELAY_MS", defaults.bootstrap_delay),
        }
    }
}
