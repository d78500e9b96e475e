//! Runtime configuration from `FLEET_*` environment variables.

use std::time::Duration;

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max`, at most
/// `max_retries` retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(500), max: Duration::from_secs(30), max_retries: 5 } }
}

impl Backoff {
    /// Delay to sleep before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing both stores in the CLI.
    pub db_path: String,
    /// Minimum spacing between two notification flushes of one context.
    pub notify_debounce: Duration,
    /// Retry policy when opening upstream change feeds.
    pub notify_backoff: Backoff,
    /// Retry policy when reading back a freshly written context.
    pub retrieve_backoff: Backoff,
    pub metrics_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            notify_debounce: Duration::from_millis(3000),
            notify_backoff: Backoff::default(),
            retrieve_backoff: Backoff { base: Duration::from_millis(100), max: Duration::from_secs(2), max_retries: 5 },
            metrics_addr: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let notify_backoff = Backoff {
            base: env_ms("FLEET_NOTIFY_BACKOFF_MS").unwrap_or(d.notify_backoff.base),
            max: env_ms("FLEET_NOTIFY_MAX_BACKOFF_MS").unwrap_or(d.notify_backoff.max),
            max_retries: env_parse("FLEET_NOTIFY_MAX_RETRIES").unwrap_or(d.notify_backoff.max_retries),
        };
        Self {
            db_path: std::env::var("FLEET_DB_PATH").unwrap_or(d.db_path),
            notify_debounce: env_ms("FLEET_NOTIFY_DEBOUNCE_MS").unwrap_or(d.notify_debounce),
            notify_backoff,
            retrieve_backoff: d.retrieve_backoff,
            metrics_addr: std::env::var("FLEET_METRICS_ADDR").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_ms(name: &str) -> Option<Duration> { env_parse::<u64>(name).map(Duration::from_millis) }

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".fleet");
        p.push("fleet.db");
        return p.to_string_lossy().to_string();
    }
    "fleet.db".to_string()
}
