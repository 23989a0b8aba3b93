//! Dictionary sync loop.
//!
//! One thread owns the refresh schedule: a periodic tick plus an inbox of
//! manual refresh commands. `recv_timeout` doubles as the tick timer, so a
//! manual refresh is served the moment it arrives instead of queueing
//! behind a sleeping periodic cycle.

use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dictionary::DictionaryCache;
use crate::source::{fetch_with_backoff, DictionarySource, FetchError};

/// Commands accepted on the sync loop's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// The backend mutated its data; refresh ahead of the next tick.
    Refresh,
    Shutdown,
}

/// Retry budget for one refresh cycle.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// Perform the startup fetch that gates the transition to running.
///
/// Returns true when a snapshot was published. On exhausted retries the
/// cache stays empty and the watcher starts anyway; matching against an
/// empty map is a no-op, not an error.
pub fn initial_fetch(
    source: &dyn DictionarySource,
    cache: &DictionaryCache,
    retry: RetryPolicy,
    stop: &AtomicBool,
) -> bool {
    match fetch_with_backoff(
        source,
        retry.max_attempts,
        retry.backoff_base,
        retry.backoff_cap,
        stop,
    ) {
        Ok(map) => {
            let count = map.len();
            cache.swap(map);
            info!(triggers = count, source = %source.describe(), "Initial dictionary loaded");
            true
        }
        Err(e) => {
            warn!(
                error = %e,
                source = %source.describe(),
                "Initial dictionary fetch failed, starting with empty dictionary"
            );
            false
        }
    }
}

/// Spawn the sync loop thread.
pub fn spawn_sync_loop(
    source: Arc<dyn DictionarySource>,
    cache: Arc<DictionaryCache>,
    inbox: Receiver<SyncCommand>,
    interval: Duration,
    retry: RetryPolicy,
    verbose_diffs: bool,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("dict-sync".to_string())
        .spawn(move || {
            run_sync_loop(&*source, &cache, inbox, interval, retry, verbose_diffs, &stop);
        })
        .unwrap_or_else(|e| panic!("failed to spawn sync thread: {}", e))
}

fn run_sync_loop(
    source: &dyn DictionarySource,
    cache: &DictionaryCache,
    inbox: Receiver<SyncCommand>,
    interval: Duration,
    retry: RetryPolicy,
    verbose_diffs: bool,
    stop: &AtomicBool,
) {
    info!(
        interval_secs = interval.as_secs(),
        source = %source.describe(),
        "Sync loop started"
    );

    loop {
        let reason = match inbox.recv_timeout(interval) {
            Ok(SyncCommand::Refresh) => "manual",
            Ok(SyncCommand::Shutdown) => {
                info!("Sync loop stopping");
                break;
            }
            Err(RecvTimeoutError::Timeout) => "periodic",
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Sync inbox closed, sync loop exiting");
                break;
            }
        };

        refresh_once(source, cache, retry, verbose_diffs, reason, stop);

        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            info!("Sync loop observed stop flag");
            break;
        }
    }
}

/// One refresh cycle: fetch (with bounded backoff on transient failures)
/// and publish. A malformed response skips the cycle without retry; a
/// transient failure that survives the retry budget is deferred to the
/// next tick.
fn refresh_once(
    source: &dyn DictionarySource,
    cache: &DictionaryCache,
    retry: RetryPolicy,
    verbose_diffs: bool,
    reason: &str,
    stop: &AtomicBool,
) {
    match fetch_with_backoff(
        source,
        retry.max_attempts,
        retry.backoff_base,
        retry.backoff_cap,
        stop,
    ) {
        Ok(map) => {
            let count = map.len();
            let diff = cache.swap(map);
            debug!(triggers = count, reason, "Dictionary refreshed");
            if verbose_diffs {
                DictionaryCache::log_diff(&diff);
            }
        }
        Err(FetchError::Malformed(msg)) => {
            warn!(error = %msg, reason, "Malformed dictionary response, skipping cycle");
        }
        Err(FetchError::Transient(msg)) => {
            warn!(error = %msg, reason, "Dictionary refresh failed, deferring to next tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::TriggerMap;
    use crate::source::StaticSource;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Instant;

    fn map(entries: &[(&str, &str)]) -> TriggerMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
        }
    }

    #[test]
    fn initial_fetch_publishes_snapshot() {
        let source = StaticSource::new(map(&[("@sig", "Best")]));
        let cache = DictionaryCache::new();
        let stop = AtomicBool::new(false);

        assert!(initial_fetch(&*source, &cache, policy(), &stop));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn initial_fetch_failure_leaves_cache_empty_but_returns() {
        let source = StaticSource::failing("connection refused");
        let cache = DictionaryCache::new();
        let stop = AtomicBool::new(false);

        let start = Instant::now();
        assert!(!initial_fetch(&*source, &cache, policy(), &stop));
        assert!(cache.is_empty());
        // Bounded: must not hang anywhere near a second with ms backoff.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn manual_refresh_is_served_before_the_tick() {
        let source = StaticSource::new(map(&[("@a", "1")]));
        let cache = Arc::new(DictionaryCache::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let handle = spawn_sync_loop(
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            Arc::clone(&cache),
            rx,
            Duration::from_secs(60), // tick far in the future
            policy(),
            false,
            Arc::clone(&stop),
        );

        source.set(map(&[("@a", "1"), ("@b", "2")]));
        tx.send(SyncCommand::Refresh).unwrap();

        // The manual refresh should land well before the 60s tick.
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.len(), 2);

        tx.send(SyncCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_command_stops_the_loop() {
        let source = StaticSource::new(TriggerMap::new());
        let cache = Arc::new(DictionaryCache::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let handle = spawn_sync_loop(
            source as Arc<dyn DictionarySource>,
            cache,
            rx,
            Duration::from_secs(60),
            policy(),
            false,
            stop,
        );

        tx.send(SyncCommand::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn dropping_the_inbox_stops_the_loop() {
        let source = StaticSource::new(TriggerMap::new());
        let cache = Arc::new(DictionaryCache::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<SyncCommand>();

        let handle = spawn_sync_loop(
            source as Arc<dyn DictionarySource>,
            cache,
            rx,
            Duration::from_millis(10),
            policy(),
            false,
            stop,
        );

        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn transient_failure_keeps_previous_snapshot() {
        let source = StaticSource::new(map(&[("@keep", "kept")]));
        let cache = DictionaryCache::new();
        let stop = AtomicBool::new(false);

        initial_fetch(&*source, &cache, policy(), &stop);
        assert_eq!(cache.len(), 1);

        source.set(TriggerMap::new());
        // Simulate a failing cycle directly.
        let failing = StaticSource::failing("timeout");
        refresh_once(&*failing, &cache, policy(), false, "test", &stop);

        // The previous snapshot remains live.
        assert!(cache.get().contains_key("@keep"));
        stop.store(true, Ordering::Relaxed);
    }
}
