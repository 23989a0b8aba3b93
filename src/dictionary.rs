//! Trigger dictionary cache.
//!
//! Holds the live trigger -> replacement snapshot shared between the sync
//! loop (sole writer) and the keystroke thread (sole reader). Snapshots are
//! handed out as `Arc<TriggerMap>`, so a match check that is already in
//! flight keeps one self-consistent snapshot even if a swap lands under it;
//! readers see either the old or the new map, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

/// Complete snapshot of the trigger table: trigger text -> replacement text.
pub type TriggerMap = HashMap<String, String>;

/// Result of swapping a new snapshot in: which triggers changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictionaryDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl DictionaryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

struct CacheInner {
    current: Arc<TriggerMap>,
    previous: Arc<TriggerMap>,
}

/// Shared dictionary cache.
///
/// The lock is scoped to `get`/`swap` only and is never held across I/O;
/// the diff in `swap` is computed against the retained previous snapshot
/// while holding the lock, but both operations are pure map work.
pub struct DictionaryCache {
    inner: Mutex<CacheInner>,
}

impl DictionaryCache {
    /// Create an empty cache. `get()` returns an empty map until the first
    /// successful swap.
    pub fn new() -> Self {
        let empty = Arc::new(TriggerMap::new());
        Self {
            inner: Mutex::new(CacheInner {
                current: Arc::clone(&empty),
                previous: empty,
            }),
        }
    }

    /// Non-blocking read of the last successfully published snapshot.
    pub fn get(&self) -> Arc<TriggerMap> {
        Arc::clone(&self.inner.lock().current)
    }

    /// Atomically replace the live snapshot, retaining the prior one, and
    /// report what changed.
    pub fn swap(&self, new: TriggerMap) -> DictionaryDiff {
        let new = Arc::new(new);
        let mut inner = self.inner.lock();

        let diff = diff_maps(&inner.current, &new);
        inner.previous = std::mem::replace(&mut inner.current, new);

        debug!(
            triggers = inner.current.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Dictionary snapshot swapped"
        );

        diff
    }

    /// Number of triggers in the live snapshot.
    pub fn len(&self) -> usize {
        self.inner.lock().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log a swap diff at info level. Used by the sync loop in verbose mode.
    pub fn log_diff(diff: &DictionaryDiff) {
        if diff.is_empty() {
            debug!("Dictionary refresh produced no changes");
            return;
        }
        info!(
            added = ?diff.added,
            removed = ?diff.removed,
            changed = ?diff.changed,
            "Dictionary changed"
        );
    }
}

impl Default for DictionaryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// O(symmetric difference) comparison of two snapshots.
fn diff_maps(old: &TriggerMap, new: &TriggerMap) -> DictionaryDiff {
    let mut diff = DictionaryDiff::default();

    for (trigger, replacement) in new {
        match old.get(trigger) {
            None => diff.added.push(trigger.clone()),
            Some(prior) if prior != replacement => diff.changed.push(trigger.clone()),
            Some(_) => {}
        }
    }
    for trigger in old.keys() {
        if !new.contains_key(trigger) {
            diff.removed.push(trigger.clone());
        }
    }

    // Deterministic ordering for logs and tests
    diff.added.sort();
    diff.removed.sort();
    diff.changed.sort();
    diff
}
