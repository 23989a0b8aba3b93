//! Watcher lifecycle controller.
//!
//! Owns the watcher state machine and the two long-lived threads: the
//! dictionary sync loop and the key event consumer. Other components hold a
//! [`WatcherHandle`] (injected explicitly, never ambient) exposing only
//! `trigger_refresh` and `stop`.
//!
//! Startup order matters: the first dictionary fetch completes (success or
//! exhausted retries) before the state becomes `Running`, so the first
//! substitution decision is made against real data rather than an empty map
//! that is about to be populated.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::dictionary::DictionaryCache;
use crate::error::{ResultExt, WatcherError};
use crate::injector::Injector;
use crate::matcher::TriggerMatcher;
use crate::monitor::{KeyEventSource, KeyHandler};
use crate::source::DictionarySource;
use crate::sync::{self, RetryPolicy, SyncCommand};

/// How long `stop()` waits for each thread before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    config: WatcherConfig,
    cache: Arc<DictionaryCache>,
    source: Arc<dyn DictionarySource>,
    injector: Arc<dyn Injector>,

    state: Mutex<WatcherState>,
    stop_flag: Arc<AtomicBool>,
    sync_tx: Mutex<Option<Sender<SyncCommand>>>,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
    key_handle: Mutex<Option<JoinHandle<()>>>,
    /// Consumed on the first successful start.
    key_source: Mutex<Option<Box<dyn KeyEventSource>>>,
}

/// The trigger-detection and substitution watcher.
pub struct Watcher {
    inner: Arc<Inner>,
}

/// Narrow handle for collaborators: refresh and stop, nothing else.
#[derive(Clone)]
pub struct WatcherHandle {
    inner: Arc<Inner>,
}

impl Watcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn DictionarySource>,
        injector: Arc<dyn Injector>,
        key_source: Option<Box<dyn KeyEventSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache: Arc::new(DictionaryCache::new()),
                source,
                injector,
                state: Mutex::new(WatcherState::Stopped),
                stop_flag: Arc::new(AtomicBool::new(false)),
                sync_tx: Mutex::new(None),
                sync_handle: Mutex::new(None),
                key_handle: Mutex::new(None),
                key_source: Mutex::new(key_source),
            }),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.inner.state.lock()
    }

    /// Live trigger count (diagnostics).
    pub fn trigger_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Start the watcher: blocking first fetch, then the sync loop and key
    /// event consumer as independent threads.
    ///
    /// Idempotent: starting an already-running watcher logs a warning and
    /// returns Ok. A missing keyboard hook or injection capability degrades
    /// the watcher instead of failing start.
    pub fn start(&self) -> Result<(), WatcherError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                WatcherState::Stopped => *state = WatcherState::Starting,
                other => {
                    warn!(state = ?other, "Watcher already started, ignoring start request");
                    return Ok(());
                }
            }
        }

        info!(source = %self.inner.source.describe(), "Starting watcher");
        self.inner.stop_flag.store(false, Ordering::Relaxed);

        let retry = self.retry_policy();

        // Bounded wait for the backend to come up, then the gating first
        // fetch. Both give up gracefully: an unreachable backend means an
        // empty dictionary, not a failed start.
        if self.inner.source.wait_ready(
            self.inner.config.ready_attempts,
            self.inner.config.ready_delay(),
            self.inner.config.port_probe_range,
            &self.inner.stop_flag,
        ) {
            sync::initial_fetch(
                &*self.inner.source,
                &self.inner.cache,
                retry,
                &self.inner.stop_flag,
            );
        }

        // Sync loop thread.
        let (tx, rx) = std::sync::mpsc::channel();
        *self.inner.sync_tx.lock() = Some(tx);
        *self.inner.sync_handle.lock() = Some(sync::spawn_sync_loop(
            Arc::clone(&self.inner.source),
            Arc::clone(&self.inner.cache),
            rx,
            self.inner.config.refresh_interval(),
            retry,
            self.inner.config.verbose_diffs,
            Arc::clone(&self.inner.stop_flag),
        ));

        // Injection capability is probed exactly once; failure puts the
        // watcher into degraded mode (detection without substitution).
        let injection_enabled = match self.inner.injector.probe() {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    "Substitution unavailable; running degraded (triggers will be \
                     detected and logged but not substituted)"
                );
                false
            }
        };

        // Key event consumer thread.
        if let Some(key_source) = self.inner.key_source.lock().take() {
            let handler = self.make_key_handler(injection_enabled);
            let stop = Arc::clone(&self.inner.stop_flag);
            let handle = thread::Builder::new()
                .name("key-events".to_string())
                .spawn(move || {
                    if let Err(e) = key_source.run(handler, stop) {
                        // Hook registration failure is fatal to substitution
                        // only; dictionary sync keeps running.
                        error!(error = %e, "Keyboard hook failed; no keystrokes will be observed");
                    }
                })
                .map_err(|e| WatcherError::Thread(e.to_string()))?;
            *self.inner.key_handle.lock() = Some(handle);
        } else {
            warn!("No key event source available; running without keystroke capture");
        }

        // The blocking fetch above can take seconds; a concurrent stop()
        // may have already moved the state past Starting. Only the Starting
        // state is promoted to Running; anything else means stop won the
        // race and whatever this start spawned must come down again.
        {
            let mut state = self.inner.state.lock();
            if *state != WatcherState::Starting {
                drop(state);
                warn!("Stop requested during start, tearing down");
                self.abort_start();
                return Ok(());
            }
            *state = WatcherState::Running;
        }
        info!(triggers = self.inner.cache.len(), "Watcher running");
        Ok(())
    }

    /// Undo a start that lost the race against a concurrent stop: signal and
    /// join the threads spawned so far and settle on Stopped.
    fn abort_start(&self) {
        self.inner.stop_flag.store(true, Ordering::Relaxed);
        if let Some(tx) = self.inner.sync_tx.lock().take() {
            let _ = tx.send(SyncCommand::Shutdown);
        }
        join_with_timeout(self.inner.sync_handle.lock().take(), "dict-sync");
        join_with_timeout(self.inner.key_handle.lock().take(), "key-events");
        *self.inner.state.lock() = WatcherState::Stopped;
    }

    /// Per-event handler: decode is already done; process the key against
    /// the current snapshot and substitute on a match. Panics are caught
    /// per event so one bad event cannot kill the consuming thread.
    fn make_key_handler(&self, injection_enabled: bool) -> KeyHandler {
        let cache = Arc::clone(&self.inner.cache);
        let injector = Arc::clone(&self.inner.injector);
        let mut matcher = TriggerMatcher::new(self.inner.config.buffer_cap);

        Box::new(move |key| {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                // Snapshot read: either pre- or post-swap, never a mix. The
                // cache lock is released before any substitution work.
                let snapshot = cache.get();
                if let Some(matched) = matcher.process(key, &snapshot) {
                    info!(
                        trigger = %matched.trigger,
                        replacement_len = matched.replacement.len(),
                        "Trigger matched"
                    );
                    if injection_enabled {
                        if let Err(e) =
                            injector.substitute(matched.trigger_chars, &matched.replacement)
                        {
                            warn!(error = %e, trigger = %matched.trigger, "Substitution failed");
                            matcher.clear();
                        }
                    } else {
                        debug!(trigger = %matched.trigger, "Degraded mode, skipping substitution");
                    }
                }
            }));

            if outcome.is_err() {
                error!("Key handler panicked; resetting typed buffer");
                matcher.clear();
            }
        })
    }

    /// Stop the watcher. Idempotent and safe to call from any thread;
    /// threads that do not exit within the join timeout are detached.
    pub fn stop(&self) {
        stop_inner(&self.inner);
    }

    /// Ask the sync loop to refresh ahead of its next tick. A no-op unless
    /// running: edits may arrive before the watcher has initialized, and
    /// that is a normal condition, not an error.
    pub fn trigger_refresh(&self) {
        trigger_refresh_inner(&self.inner);
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.inner.config.fetch_retries,
            backoff_base: self.inner.config.backoff_base(),
            backoff_cap: self.inner.config.backoff_cap(),
        }
    }
}

impl WatcherHandle {
    pub fn trigger_refresh(&self) {
        trigger_refresh_inner(&self.inner);
    }

    pub fn stop(&self) {
        stop_inner(&self.inner);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // Handles may still keep Inner alive; only the owning Watcher tears
        // the threads down.
        stop_inner(&self.inner);
    }
}

fn trigger_refresh_inner(inner: &Inner) {
    if *inner.state.lock() != WatcherState::Running {
        debug!("Refresh requested while not running, ignoring");
        return;
    }
    if let Some(tx) = &*inner.sync_tx.lock() {
        // A closed inbox only means the loop is already gone; drop the
        // refresh with a warning.
        tx.send(SyncCommand::Refresh).warn_on_err();
    }
}

fn stop_inner(inner: &Inner) {
    {
        let mut state = inner.state.lock();
        match *state {
            WatcherState::Stopped => {
                debug!("Watcher already stopped");
                return;
            }
            WatcherState::Stopping => {
                debug!("Watcher already stopping");
                return;
            }
            _ => *state = WatcherState::Stopping,
        }
    }

    info!("Stopping watcher");
    inner.stop_flag.store(true, Ordering::Relaxed);

    if let Some(tx) = inner.sync_tx.lock().take() {
        let _ = tx.send(SyncCommand::Shutdown);
    }

    join_with_timeout(inner.sync_handle.lock().take(), "dict-sync");
    join_with_timeout(inner.key_handle.lock().take(), "key-events");

    *inner.state.lock() = WatcherState::Stopped;
    info!("Watcher stopped");
}

/// Join a thread, but never hang shutdown on it: past the timeout the
/// handle is dropped and the thread is left to die with the process.
fn join_with_timeout(handle: Option<JoinHandle<()>>, name: &str) {
    let Some(handle) = handle else {
        return;
    };

    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, "Thread did not exit in time, detaching");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }

    if handle.join().is_err() {
        error!(thread = name, "Thread panicked during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::TriggerMap;
    use crate::error::InjectError;
    use crate::matcher::KeyInput;
    use crate::monitor::ChannelKeySource;
    use crate::source::{FetchError, StaticSource};
    use std::sync::atomic::AtomicUsize;

    fn map(entries: &[(&str, &str)]) -> TriggerMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_config() -> WatcherConfig {
        WatcherConfig {
            ready_attempts: 1,
            ready_delay_ms: 1,
            fetch_retries: 1,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            refresh_interval_secs: 60,
            ..WatcherConfig::default()
        }
    }

    /// Injector that records substitutions instead of touching the OS.
    struct RecordingInjector {
        calls: Mutex<Vec<(usize, String)>>,
        probe_ok: bool,
    }

    impl RecordingInjector {
        fn new(probe_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                probe_ok,
            })
        }

        fn calls(&self) -> Vec<(usize, String)> {
            self.calls.lock().clone()
        }
    }

    impl Injector for RecordingInjector {
        fn probe(&self) -> Result<(), InjectError> {
            if self.probe_ok {
                Ok(())
            } else {
                Err(InjectError::Unsupported)
            }
        }

        fn substitute(&self, trigger_chars: usize, replacement: &str) -> Result<(), InjectError> {
            self.calls.lock().push((trigger_chars, replacement.to_string()));
            Ok(())
        }
    }

    fn type_chars(tx: &Sender<KeyInput>, s: &str) {
        for c in s.chars() {
            let key = if c == ' ' {
                KeyInput::Space
            } else {
                KeyInput::Printable(c)
            };
            tx.send(key).unwrap();
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(cond(), "condition not met within deadline");
    }

    #[test]
    fn start_loads_dictionary_and_runs() {
        let source = StaticSource::new(map(&[("@sig", "Best regards")]));
        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(test_config(), source, injector, Some(key_source));
        assert_eq!(watcher.state(), WatcherState::Stopped);

        watcher.start().unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);
        assert_eq!(watcher.trigger_count(), 1);

        watcher.stop();
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[test]
    fn start_is_idempotent() {
        let source = StaticSource::new(map(&[("@a", "1")]));
        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(test_config(), source, injector, Some(key_source));
        watcher.start().unwrap();
        // Second start: warning, no duplicate threads, still running.
        watcher.start().unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);

        watcher.stop();
    }

    #[test]
    fn stop_is_idempotent_and_reentrant() {
        let source = StaticSource::new(TriggerMap::new());
        let injector = RecordingInjector::new(true);

        let watcher = Watcher::new(test_config(), source, injector, None);
        watcher.start().unwrap();

        watcher.stop();
        watcher.stop();
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[test]
    fn unreachable_source_still_reaches_running_with_empty_dictionary() {
        let source = StaticSource::failing("connection refused");
        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(test_config(), source, injector, Some(key_source));
        let started = Instant::now();
        watcher.start().unwrap();

        assert_eq!(watcher.state(), WatcherState::Running);
        assert_eq!(watcher.trigger_count(), 0);
        // Bounded retries: no indefinite hang.
        assert!(started.elapsed() < Duration::from_secs(10));

        watcher.stop();
    }

    #[test]
    fn typed_trigger_reaches_the_injector() {
        let source = StaticSource::new(map(&[("@f", "front-end")]));
        let injector = RecordingInjector::new(true);
        let (tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(
            test_config(),
            source,
            Arc::clone(&injector) as Arc<dyn Injector>,
            Some(key_source),
        );
        watcher.start().unwrap();

        type_chars(&tx, "hello@f");

        wait_for(|| !injector.calls().is_empty());
        let calls = injector.calls();
        assert_eq!(calls, vec![(2, "front-end".to_string())]);

        watcher.stop();
    }

    #[test]
    fn degraded_mode_detects_but_does_not_substitute() {
        let source = StaticSource::new(map(&[("@f", "front-end")]));
        let injector = RecordingInjector::new(false); // probe fails
        let (tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(
            test_config(),
            source,
            Arc::clone(&injector) as Arc<dyn Injector>,
            Some(key_source),
        );
        watcher.start().unwrap();
        assert_eq!(watcher.state(), WatcherState::Running);

        type_chars(&tx, "x@f");
        // Give the consumer a moment; no substitution must be recorded.
        thread::sleep(Duration::from_millis(200));
        assert!(injector.calls().is_empty());

        watcher.stop();
    }

    #[test]
    fn refresh_handle_converges_dictionary() {
        let source = StaticSource::new(map(&[("@a", "1")]));
        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(
            test_config(),
            Arc::clone(&source) as Arc<dyn DictionarySource>,
            injector,
            Some(key_source),
        );
        watcher.start().unwrap();
        assert_eq!(watcher.trigger_count(), 1);

        source.set(map(&[("@a", "1"), ("@b", "2")]));
        let handle = watcher.handle();
        handle.trigger_refresh();

        wait_for(|| watcher.trigger_count() == 2);

        watcher.stop();
    }

    #[test]
    fn refresh_before_start_is_a_silent_noop() {
        let source = StaticSource::new(TriggerMap::new());
        let injector = RecordingInjector::new(true);

        let watcher = Watcher::new(test_config(), source, injector, None);
        // Must not panic or error: edits can happen before the watcher is up.
        watcher.trigger_refresh();
        watcher.handle().trigger_refresh();
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[test]
    fn stop_from_handle_on_another_thread() {
        let source = StaticSource::new(TriggerMap::new());
        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(test_config(), source, injector, Some(key_source));
        watcher.start().unwrap();

        let handle = watcher.handle();
        thread::spawn(move || handle.stop()).join().unwrap();

        wait_for(|| watcher.state() == WatcherState::Stopped);
    }

    #[test]
    fn stop_during_start_leaves_the_watcher_stopped() {
        // The first fetch blocks start() for a while; a stop() issued from
        // another thread during that window must win, and start() must not
        // resurrect the state to Running afterwards.
        struct SlowSource;

        impl DictionarySource for SlowSource {
            fn fetch(&self) -> Result<TriggerMap, FetchError> {
                thread::sleep(Duration::from_millis(500));
                Ok(TriggerMap::new())
            }

            fn describe(&self) -> String {
                "slow".to_string()
            }
        }

        let injector = RecordingInjector::new(true);
        let (_tx, key_source) = ChannelKeySource::new();
        let watcher = Arc::new(Watcher::new(
            test_config(),
            Arc::new(SlowSource),
            injector,
            Some(key_source),
        ));

        let starter = {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.start())
        };

        // Let start() block inside the slow fetch, then stop from here.
        thread::sleep(Duration::from_millis(100));
        watcher.stop();
        starter.join().unwrap().unwrap();

        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[test]
    fn substitution_failure_resets_buffer_and_keeps_consumer_alive() {
        struct FailingInjector {
            attempts: AtomicUsize,
        }

        impl Injector for FailingInjector {
            fn probe(&self) -> Result<(), InjectError> {
                Ok(())
            }
            fn substitute(&self, _: usize, _: &str) -> Result<(), InjectError> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Err(InjectError::KeySynthesis("synthetic failure".to_string()))
            }
        }

        let source = StaticSource::new(map(&[("@f", "x")]));
        let injector = Arc::new(FailingInjector {
            attempts: AtomicUsize::new(0),
        });
        let (tx, key_source) = ChannelKeySource::new();

        let watcher = Watcher::new(
            test_config(),
            source,
            Arc::clone(&injector) as Arc<dyn Injector>,
            Some(key_source),
        );
        watcher.start().unwrap();

        type_chars(&tx, "a@f");
        wait_for(|| injector.attempts.load(Ordering::SeqCst) == 1);

        // The consumer survived the failure and keeps matching.
        type_chars(&tx, "b@f");
        wait_for(|| injector.attempts.load(Ordering::SeqCst) == 2);

        watcher.stop();
    }
}
