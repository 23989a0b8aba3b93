//! Substitution executor: erase the trigger, paste the replacement.
//!
//! The substitution assumes (and cannot verify) that the focused
//! application's cursor still sits immediately after the just-typed trigger:
//! it synthesizes one backspace per trigger character, stages the
//! replacement on the system clipboard, waits a short settle delay for the
//! clipboard write to propagate, then synthesizes the platform paste chord.
//!
//! Availability is probed once at startup; when clipboard or key-injection
//! primitives are missing (no accessibility permission, unsupported
//! platform) the watcher keeps running in a degraded mode where matches are
//! detected and logged but not substituted.

use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use tracing::{debug, info};

use crate::error::{InjectError, ResultExt};

/// Delay after the paste chord before restoring the saved clipboard.
const CLIPBOARD_RESTORE_DELAY: Duration = Duration::from_millis(100);

/// Performs one substitution: N backspaces, clipboard staging, paste chord.
pub trait Injector: Send + Sync {
    /// One-time availability check. Called at watcher startup so a
    /// permissions problem fails loudly exactly once.
    fn probe(&self) -> Result<(), InjectError>;

    /// Erase `trigger_chars` characters and paste `replacement` in their place.
    fn substitute(&self, trigger_chars: usize, replacement: &str) -> Result<(), InjectError>;
}

/// Real injector backed by the OS clipboard and synthetic key events.
pub struct TextInjector {
    settle_delay: Duration,
}

impl TextInjector {
    pub fn new(settle_delay: Duration) -> Self {
        Self { settle_delay }
    }
}

impl Injector for TextInjector {
    fn probe(&self) -> Result<(), InjectError> {
        platform::check_key_synthesis()?;
        Clipboard::new().map_err(|e| InjectError::Clipboard(e.to_string()))?;
        debug!("Injection primitives available");
        Ok(())
    }

    fn substitute(&self, trigger_chars: usize, replacement: &str) -> Result<(), InjectError> {
        platform::send_backspaces(trigger_chars)?;

        let mut clipboard =
            Clipboard::new().map_err(|e| InjectError::Clipboard(e.to_string()))?;

        // Save the user's clipboard so the substitution is not destructive
        // beyond the trigger text itself.
        let saved = clipboard.get_text().ok();

        clipboard
            .set_text(replacement)
            .map_err(|e| InjectError::Clipboard(e.to_string()))?;

        // Clipboard propagation is asynchronous; pasting immediately races
        // the write and can paste stale content.
        thread::sleep(self.settle_delay);

        platform::send_paste_chord()?;

        if let Some(original) = saved {
            thread::sleep(CLIPBOARD_RESTORE_DELAY);
            // Best-effort restore; the substitution itself already landed.
            clipboard.set_text(&original).warn_on_err();
        }

        info!(
            erased_chars = trigger_chars,
            replacement_len = replacement.len(),
            "Substitution completed"
        );
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use core_graphics::event::{CGEvent, CGEventFlags, CGEventTapLocation, CGKeyCode};
    use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
    use macos_accessibility_client::accessibility;

    // macOS virtual keycodes
    const KEY_DELETE: CGKeyCode = 51;
    const KEY_V: CGKeyCode = 9;

    /// Gap between individual synthetic key events.
    const KEY_EVENT_GAP: Duration = Duration::from_millis(5);

    pub fn check_key_synthesis() -> Result<(), InjectError> {
        if !accessibility::application_is_trusted() {
            return Err(InjectError::KeySynthesis(
                "accessibility permission not granted (System Settings > Privacy & Security > Accessibility)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn event_source() -> Result<CGEventSource, InjectError> {
        CGEventSource::new(CGEventSourceStateID::HIDSystemState)
            .map_err(|_| InjectError::KeySynthesis("failed to create event source".to_string()))
    }

    fn press_key(key: CGKeyCode, flags: CGEventFlags) -> Result<(), InjectError> {
        let source = event_source()?;

        let key_down = CGEvent::new_keyboard_event(source.clone(), key, true)
            .map_err(|_| InjectError::KeySynthesis("failed to create key down".to_string()))?;
        key_down.set_flags(flags);

        let key_up = CGEvent::new_keyboard_event(source, key, false)
            .map_err(|_| InjectError::KeySynthesis("failed to create key up".to_string()))?;
        key_up.set_flags(flags);

        key_down.post(CGEventTapLocation::HID);
        thread::sleep(KEY_EVENT_GAP);
        key_up.post(CGEventTapLocation::HID);
        Ok(())
    }

    /// One synthetic backspace per character of the matched trigger.
    pub fn send_backspaces(count: usize) -> Result<(), InjectError> {
        for _ in 0..count {
            press_key(KEY_DELETE, CGEventFlags::empty())?;
        }
        Ok(())
    }

    /// Cmd+V, the platform paste chord.
    pub fn send_paste_chord() -> Result<(), InjectError> {
        press_key(KEY_V, CGEventFlags::CGEventFlagCommand)
    }
}

#[cfg(not(target_os = "macos"))]
mod platform {
    use super::*;

    pub fn check_key_synthesis() -> Result<(), InjectError> {
        Err(InjectError::Unsupported)
    }

    pub fn send_backspaces(_count: usize) -> Result<(), InjectError> {
        Err(InjectError::Unsupported)
    }

    pub fn send_paste_chord() -> Result<(), InjectError> {
        Err(InjectError::Unsupported)
    }
}


// System tests: interact with the real clipboard and key synthesis.
// Run with: cargo test --features system-tests
#[cfg(all(test, feature = "system-tests", target_os = "macos"))]
mod system_tests {
    use super::*;

    #[test]
    fn probe_does_not_panic() {
        let injector = TextInjector::new(Duration::from_millis(100));
        // Result depends on accessibility permission; only verify no panic.
        let _ = injector.probe();
    }

    #[test]
    #[ignore = "Types into the focused application"]
    fn substitute_pastes_into_focused_app() {
        // Focus a scratch text field before running:
        // cargo test --features system-tests substitute_pastes_into_focused_app -- --ignored
        let injector = TextInjector::new(Duration::from_millis(100));
        injector.substitute(0, "substituted text").unwrap();
    }
}
