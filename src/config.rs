//! Watcher configuration.
//!
//! Loaded from `~/.autotext/config.json` with serde defaults for every field,
//! so a partial (or absent) config file is always valid. The CLI can override
//! individual fields after loading; there is no runtime reconfiguration
//! beyond start/stop.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Default base URL of the snippet backend.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Default periodic dictionary refresh interval (seconds).
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

/// Default typed-buffer cap before it is cleared.
pub const DEFAULT_BUFFER_CAP: usize = 100;

/// Default settle delay between clipboard write and paste chord (ms).
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 100;

/// Default readiness probe budget for a backend that is still starting up.
pub const DEFAULT_READY_ATTEMPTS: u32 = 5;
pub const DEFAULT_READY_DELAY_MS: u64 = 1000;

/// How many ports above the configured one to scan when the backend had to
/// shift because its default port was occupied.
pub const DEFAULT_PORT_PROBE_RANGE: u16 = 5;

/// Default transient-failure retry budget within one sync cycle.
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Base URL of the snippet backend exposing `/api/autotexts/dict`.
    #[serde(default = "default_base_url", rename = "baseUrl")]
    pub base_url: String,

    /// Seconds between periodic dictionary refreshes.
    #[serde(default = "default_refresh_interval", rename = "refreshIntervalSecs")]
    pub refresh_interval_secs: u64,

    /// Typed-buffer length cap.
    #[serde(default = "default_buffer_cap", rename = "bufferCap")]
    pub buffer_cap: usize,

    /// Delay between staging the clipboard and issuing the paste chord (ms).
    #[serde(default = "default_settle_delay", rename = "settleDelayMs")]
    pub settle_delay_ms: u64,

    /// Startup readiness probe: attempts and spacing.
    #[serde(default = "default_ready_attempts", rename = "readyAttempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_delay", rename = "readyDelayMs")]
    pub ready_delay_ms: u64,

    /// Ports above the configured one to scan when probing for the backend.
    #[serde(default = "default_port_probe_range", rename = "portProbeRange")]
    pub port_probe_range: u16,

    /// Transient fetch failures: bounded retries with exponential backoff.
    #[serde(default = "default_fetch_retries", rename = "fetchRetries")]
    pub fetch_retries: u32,
    #[serde(default = "default_backoff_base", rename = "backoffBaseMs")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap", rename = "backoffCapMs")]
    pub backoff_cap_ms: u64,

    /// Log added/removed/changed triggers on every dictionary swap.
    #[serde(default, rename = "verboseDiffs")]
    pub verbose_diffs: bool,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}
fn default_buffer_cap() -> usize {
    DEFAULT_BUFFER_CAP
}
fn default_settle_delay() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}
fn default_ready_attempts() -> u32 {
    DEFAULT_READY_ATTEMPTS
}
fn default_ready_delay() -> u64 {
    DEFAULT_READY_DELAY_MS
}
fn default_port_probe_range() -> u16 {
    DEFAULT_PORT_PROBE_RANGE
}
fn default_fetch_retries() -> u32 {
    DEFAULT_FETCH_RETRIES
}
fn default_backoff_base() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_cap() -> u64 {
    DEFAULT_BACKOFF_CAP_MS
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            base_url: default_base_url(),
            refresh_interval_secs: default_refresh_interval(),
            buffer_cap: default_buffer_cap(),
            settle_delay_ms: default_settle_delay(),
            ready_attempts: default_ready_attempts(),
            ready_delay_ms: default_ready_delay(),
            port_probe_range: default_port_probe_range(),
            fetch_retries: default_fetch_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            verbose_diffs: false,
        }
    }
}

impl WatcherConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Default config file location (~/.autotext/config.json)
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".autotext").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("autotext-config.json"))
}

/// Load the config from disk, falling back to defaults when the file is
/// missing or unparseable. A broken config file must never stop the watcher.
#[instrument(name = "load_config")]
pub fn load_config(path: &Path) -> WatcherConfig {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return WatcherConfig::default();
    }

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read config, using defaults");
            return WatcherConfig::default();
        }
    };

    match serde_json::from_str::<WatcherConfig>(&raw) {
        Ok(config) => {
            info!(path = %path.display(), base_url = %config.base_url, "Loaded config");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
            WatcherConfig::default()
        }
    }
}
