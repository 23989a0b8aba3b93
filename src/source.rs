//! Dictionary source: the snippet backend's read endpoint.
//!
//! The backend exposes a single flat mapping at `/api/autotexts/dict`
//! (`{"trigger": "replacement", ...}`). Everything here is classified into
//! two failure modes: transient (connection refused, timeout - worth
//! retrying) and malformed (bad status or undecodable body - skip the cycle).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dictionary::TriggerMap;

/// Request timeout for a single dictionary fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum trigger length accepted from the backend.
const MIN_TRIGGER_LEN: usize = 2;

/// Granularity at which backoff sleeps observe the shutdown flag.
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum FetchError {
    /// Backend not reachable yet, or the request timed out. Retryable.
    #[error("dictionary endpoint unreachable: {0}")]
    Transient(String),

    /// The backend answered but the response was unusable. Not retried
    /// within the same cycle.
    #[error("malformed dictionary response: {0}")]
    Malformed(String),
}

/// A source of complete trigger-map snapshots.
pub trait DictionarySource: Send + Sync {
    fn fetch(&self) -> Result<TriggerMap, FetchError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Bounded wait for the source to become reachable at startup.
    /// In-memory sources are always ready.
    fn wait_ready(
        &self,
        _attempts: u32,
        _delay: Duration,
        _port_range: u16,
        _stop: &AtomicBool,
    ) -> bool {
        true
    }
}

/// HTTP source backed by the snippet backend.
pub struct HttpDictionarySource {
    agent: ureq::Agent,
    /// Resolved base URL; `lock_on` can move this within the probe range
    /// when the backend had to shift ports.
    base_url: parking_lot::Mutex<String>,
}

impl HttpDictionarySource {
    pub fn new(base_url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            base_url: parking_lot::Mutex::new(base_url.trim_end_matches('/').to_string()),
        }
    }

    fn dict_url(&self) -> String {
        format!("{}/api/autotexts/dict", self.base_url.lock())
    }

    fn fetch_from(&self, url: &str) -> Result<TriggerMap, FetchError> {
        let response = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::StatusCode(code) => {
                FetchError::Malformed(format!("unexpected status {}", code))
            }
            other => FetchError::Transient(other.to_string()),
        })?;

        let raw: HashMap<String, String> = response
            .into_body()
            .read_json()
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        Ok(sanitize_triggers(raw))
    }

    /// Probe the configured base URL, then its neighbors within the port
    /// range, waiting for the backend to come up. Locks onto the first URL
    /// that answers. Returns false if the whole budget is exhausted; the
    /// watcher then starts with an empty dictionary.
    fn probe_ready(
        &self,
        attempts: u32,
        delay: Duration,
        port_range: u16,
        stop: &AtomicBool,
    ) -> bool {
        let candidates = candidate_urls(&self.base_url.lock(), port_range);

        for attempt in 1..=attempts {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            for url in &candidates {
                match self.fetch_from(&format!("{}/api/autotexts/dict", url)) {
                    Ok(_) | Err(FetchError::Malformed(_)) => {
                        // The backend answered; malformed payloads are the
                        // sync loop's problem, reachability is settled.
                        if *self.base_url.lock() != *url {
                            info!(url = %url, "Backend found on shifted port");
                            *self.base_url.lock() = url.clone();
                        }
                        debug!(url = %url, attempt, "Backend is reachable");
                        return true;
                    }
                    Err(FetchError::Transient(_)) => {}
                }
            }
            debug!(attempt, max_attempts = attempts, "Backend not ready yet");
            if attempt < attempts {
                sleep_observing(delay, stop);
            }
        }

        warn!(
            attempts,
            "Backend never became reachable, continuing with empty dictionary"
        );
        false
    }
}

impl DictionarySource for HttpDictionarySource {
    fn fetch(&self) -> Result<TriggerMap, FetchError> {
        self.fetch_from(&self.dict_url())
    }

    fn describe(&self) -> String {
        self.dict_url()
    }

    fn wait_ready(
        &self,
        attempts: u32,
        delay: Duration,
        port_range: u16,
        stop: &AtomicBool,
    ) -> bool {
        self.probe_ready(attempts, delay, port_range, stop)
    }
}

/// Drop triggers the matcher can never act on. The backend guarantees
/// uniqueness; length is enforced here because a one-character trigger
/// would fire on ordinary typing.
fn sanitize_triggers(raw: HashMap<String, String>) -> TriggerMap {
    let mut map = TriggerMap::with_capacity(raw.len());
    for (trigger, replacement) in raw {
        if trigger.chars().count() < MIN_TRIGGER_LEN {
            warn!(trigger = %trigger, "Ignoring trigger shorter than {} characters", MIN_TRIGGER_LEN);
            continue;
        }
        map.insert(trigger, replacement);
    }
    map
}

/// The configured URL plus shifted-port variants, e.g. for
/// `http://127.0.0.1:8000` with range 2: `:8000`, `:8001`, `:8002`.
/// URLs without an explicit port are returned as-is.
fn candidate_urls(base_url: &str, port_range: u16) -> Vec<String> {
    let Some((prefix, port)) = split_port(base_url) else {
        return vec![base_url.to_string()];
    };
    (0..=port_range)
        .filter_map(|offset| port.checked_add(offset))
        .map(|port| format!("{}:{}", prefix, port))
        .collect()
}

/// Split `scheme://host:port` into (`scheme://host`, port).
fn split_port(base_url: &str) -> Option<(&str, u16)> {
    let authority_start = base_url.find("://").map(|i| i + 3).unwrap_or(0);
    let colon = base_url[authority_start..]
        .rfind(':')
        .map(|i| i + authority_start)?;
    let port = base_url[colon + 1..].parse::<u16>().ok()?;
    Some((&base_url[..colon], port))
}

/// Fetch with bounded exponential backoff on transient failures.
///
/// Backoff doubles from `base` up to `cap`. A malformed response aborts the
/// cycle immediately (retrying cannot fix it). The shutdown flag is observed
/// at slice granularity so pending retries abandon promptly on stop.
pub fn fetch_with_backoff(
    source: &dyn DictionarySource,
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    stop: &AtomicBool,
) -> Result<TriggerMap, FetchError> {
    let mut delay = base;
    let mut last_err = FetchError::Transient("no attempts made".to_string());

    for attempt in 1..=max_attempts.max(1) {
        if stop.load(Ordering::Relaxed) {
            return Err(FetchError::Transient("shutting down".to_string()));
        }

        match source.fetch() {
            Ok(map) => return Ok(map),
            Err(FetchError::Malformed(msg)) => return Err(FetchError::Malformed(msg)),
            Err(FetchError::Transient(msg)) => {
                debug!(attempt, max_attempts, error = %msg, "Transient fetch failure");
                last_err = FetchError::Transient(msg);
            }
        }

        if attempt < max_attempts {
            sleep_observing(delay, stop);
            delay = (delay * 2).min(cap);
        }
    }

    Err(last_err)
}

/// Sleep in slices, returning early when the stop flag is raised.
fn sleep_observing(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let slice = remaining.min(BACKOFF_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

/// In-memory source for tests and embedding.
pub struct StaticSource {
    map: parking_lot::Mutex<Result<TriggerMap, String>>,
}

impl StaticSource {
    pub fn new(map: TriggerMap) -> Arc<Self> {
        Arc::new(Self {
            map: parking_lot::Mutex::new(Ok(map)),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            map: parking_lot::Mutex::new(Err(message.to_string())),
        })
    }

    pub fn set(&self, map: TriggerMap) {
        *self.map.lock() = Ok(map);
    }
}

impl DictionarySource for StaticSource {
    fn fetch(&self) -> Result<TriggerMap, FetchError> {
        match &*self.map.lock() {
            Ok(map) => Ok(map.clone()),
            Err(message) => Err(FetchError::Transient(message.clone())),
        }
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}
