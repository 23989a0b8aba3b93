//! Trigger matching over a rolling buffer of recent keystrokes.
//!
//! The matcher is a Mealy-style machine: its only state is the typed buffer,
//! and every key event is one transition. Raw OS events are decoded into the
//! closed [`KeyInput`] set at the boundary (see `monitor`), so the transition
//! rules here dispatch on a finite, exhaustive enum.
//!
//! A match check reads the buffer plus one read-only dictionary snapshot;
//! it never holds the cache lock, and substitution side effects happen
//! outside this module.

use tracing::{debug, trace};

use crate::dictionary::TriggerMap;

/// A key event after boundary decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    /// A single printable character (modifier-free keystroke).
    Printable(char),
    /// Space is appended like any character and still match-checked.
    Space,
    Backspace,
    Enter,
    /// Shift, Ctrl, Alt, Tab, Caps Lock, Escape - ignored entirely.
    Modifier,
    /// Anything else (function keys, navigation, unknown codes).
    Other,
}

/// A recognized trigger and the replacement to substitute for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub trigger: String,
    pub replacement: String,
    /// Character count of the trigger; the number of backspaces to emit.
    pub trigger_chars: usize,
}

/// Rolling typed-buffer state machine with longest-match trigger detection.
pub struct TriggerMatcher {
    buffer: String,
    cap: usize,
}

impl TriggerMatcher {
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: String::new(),
            cap,
        }
    }

    /// Current buffer contents (for diagnostics and tests).
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Reset to empty. Also the safe default after a handler error.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Apply one key event against the given dictionary snapshot.
    ///
    /// Returns the matched trigger when the keystroke just completed one.
    /// On a match the buffer is reset to the residual prefix (everything
    /// before the trigger), so following keystrokes keep composing against
    /// the surrounding context.
    pub fn process(&mut self, key: KeyInput, triggers: &TriggerMap) -> Option<TriggerMatch> {
        match key {
            KeyInput::Enter => {
                self.buffer.clear();
                None
            }
            KeyInput::Backspace => {
                self.buffer.pop();
                None
            }
            KeyInput::Modifier => None,
            KeyInput::Space => self.append_and_check(' ', triggers),
            KeyInput::Printable(c) => self.append_and_check(c, triggers),
            KeyInput::Other => {
                if self.char_len() > self.cap {
                    debug!(len = self.char_len(), cap = self.cap, "Buffer over cap, clearing");
                    self.buffer.clear();
                }
                None
            }
        }
    }

    fn append_and_check(&mut self, c: char, triggers: &TriggerMap) -> Option<TriggerMatch> {
        self.buffer.push(c);

        if let Some(matched) = longest_suffix_match(&self.buffer, triggers) {
            trace!(trigger = %matched.trigger, "Trigger matched");
            self.truncate_chars(matched.trigger_chars);
            return Some(matched);
        }

        // Bound growth and match-search cost: a buffer past the cap can no
        // longer be extended into a match worth more than its tail.
        if self.char_len() > self.cap {
            debug!(cap = self.cap, "Buffer exceeded cap without a match, clearing");
            self.buffer.clear();
        }
        None
    }

    fn char_len(&self) -> usize {
        self.buffer.chars().count()
    }

    /// Remove the last `count` characters (not bytes).
    fn truncate_chars(&mut self, count: usize) {
        let keep = self.char_len().saturating_sub(count);
        let byte_end = self
            .buffer
            .char_indices()
            .nth(keep)
            .map(|(i, _)| i)
            .unwrap_or(self.buffer.len());
        self.buffer.truncate(byte_end);
    }
}

/// Longest-match-wins over all triggers that are a suffix of `buffer`.
///
/// Ties are impossible: a string has exactly one suffix of each length, so
/// two distinct triggers matching the same suffix must differ in length.
fn longest_suffix_match(buffer: &str, triggers: &TriggerMap) -> Option<TriggerMatch> {
    let mut best: Option<(&str, &str)> = None;

    for (trigger, replacement) in triggers {
        if trigger.is_empty() || !buffer.ends_with(trigger.as_str()) {
            continue;
        }
        let is_longer = best.is_none_or(|(current, _)| trigger.len() > current.len());
        if is_longer {
            best = Some((trigger.as_str(), replacement.as_str()));
        }
    }

    best.map(|(trigger, replacement)| TriggerMatch {
        trigger: trigger.to_string(),
        replacement: replacement.to_string(),
        trigger_chars: trigger.chars().count(),
    })
}
