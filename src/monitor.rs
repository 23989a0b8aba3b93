//! Key event stream adapters.
//!
//! The OS delivers loosely-typed key events; everything is decoded into the
//! closed [`KeyInput`] set right here at the boundary so the matcher never
//! sees raw keycodes. The [`KeyEventSource`] trait is the seam between the
//! watcher and the platform: the macOS backend wraps a listen-only
//! CGEventTap on a CFRunLoop, and [`ChannelKeySource`] feeds decoded events
//! from an mpsc channel (tests, embedding).
//!
//! Key-down events are handled strictly one at a time, in arrival order;
//! the typed buffer never races.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::WatcherError;
use crate::matcher::KeyInput;

/// Per-event callback invoked on the consuming thread.
pub type KeyHandler = Box<dyn FnMut(KeyInput) + Send>;

/// How often a blocked consumer re-checks the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A blocking stream of decoded key-down events.
pub trait KeyEventSource: Send {
    /// Consume events until the stop flag is raised, invoking `handler` for
    /// each key-down. Returns when stopped or when the stream ends; the
    /// subscription is torn down before returning.
    fn run(self: Box<Self>, handler: KeyHandler, stop: Arc<AtomicBool>)
        -> Result<(), WatcherError>;
}

/// mpsc-backed source: whatever is sent on the channel is the event stream.
pub struct ChannelKeySource {
    rx: Receiver<KeyInput>,
}

impl ChannelKeySource {
    pub fn new() -> (Sender<KeyInput>, Box<Self>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (tx, Box::new(Self { rx }))
    }
}

impl KeyEventSource for ChannelKeySource {
    fn run(
        self: Box<Self>,
        mut handler: KeyHandler,
        stop: Arc<AtomicBool>,
    ) -> Result<(), WatcherError> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            match self.rx.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(key) => handler(key),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Key event channel closed, consumer exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// The platform's global key hook, if one is implemented for this OS.
pub fn system_key_source() -> Result<Box<dyn KeyEventSource>, WatcherError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::EventTapSource::new()))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Err(WatcherError::HookUnavailable(
            "global key capture is only implemented for macOS".to_string(),
        ))
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;
    use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop};
    use core_graphics::event::{
        CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
        CGEventType, EventField,
    };
    use std::cell::RefCell;
    use tracing::debug;

    /// Listen-only CGEventTap over system-wide key-down events.
    pub struct EventTapSource;

    impl EventTapSource {
        pub fn new() -> Self {
            Self
        }
    }

    impl KeyEventSource for EventTapSource {
        fn run(
            self: Box<Self>,
            handler: KeyHandler,
            stop: Arc<AtomicBool>,
        ) -> Result<(), WatcherError> {
            let handler = RefCell::new(handler);

            let tap = CGEventTap::new(
                CGEventTapLocation::HID,
                CGEventTapPlacement::HeadInsertEventTap,
                CGEventTapOptions::ListenOnly,
                vec![CGEventType::KeyDown],
                |_proxy, event_type, event| {
                    if matches!(event_type, CGEventType::KeyDown) {
                        let key_code =
                            event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE);
                        let flags = event.get_flags();
                        (handler.borrow_mut())(decode(key_code, flags));
                    }
                    // Listen-only tap: never swallow or rewrite the event.
                    None
                },
            )
            .map_err(|_| {
                WatcherError::HookUnavailable(
                    "failed to create event tap (accessibility permission required)".to_string(),
                )
            })?;

            let loop_source = tap.mach_port.create_runloop_source(0).map_err(|_| {
                WatcherError::HookUnavailable("failed to create run loop source".to_string())
            })?;

            let run_loop = CFRunLoop::get_current();
            run_loop.add_source(&loop_source, unsafe { kCFRunLoopDefaultMode });
            tap.enable();

            info!("Keyboard event tap installed");

            // Run the loop in bounded slices so the stop flag is observed
            // promptly; dropping the tap on exit removes the subscription.
            while !stop.load(Ordering::Relaxed) {
                CFRunLoop::run_in_mode(
                    unsafe { kCFRunLoopDefaultMode },
                    STOP_POLL_INTERVAL,
                    false,
                );
            }

            debug!("Keyboard event tap shutting down");
            Ok(())
        }
    }

    // macOS virtual keycodes (ANSI layout)
    const KEY_RETURN: i64 = 36;
    const KEY_TAB: i64 = 48;
    const KEY_SPACE: i64 = 49;
    const KEY_DELETE: i64 = 51;
    const KEY_ESCAPE: i64 = 53;
    const KEY_KEYPAD_ENTER: i64 = 76;

    /// Decode one key-down into the matcher's closed event set.
    fn decode(key_code: i64, flags: CGEventFlags) -> KeyInput {
        // A chord with command/control/option held is a shortcut, not typing.
        if flags.contains(CGEventFlags::CGEventFlagCommand)
            || flags.contains(CGEventFlags::CGEventFlagControl)
            || flags.contains(CGEventFlags::CGEventFlagAlternate)
        {
            return KeyInput::Modifier;
        }

        match key_code {
            KEY_RETURN | KEY_KEYPAD_ENTER => KeyInput::Enter,
            KEY_DELETE => KeyInput::Backspace,
            KEY_SPACE => KeyInput::Space,
            KEY_TAB | KEY_ESCAPE => KeyInput::Modifier,
            // Standalone modifier key-downs (shift, caps, etc.)
            54..=63 => KeyInput::Modifier,
            _ => {
                let shifted = flags.contains(CGEventFlags::CGEventFlagShift);
                match printable_for(key_code, shifted) {
                    Some(c) => KeyInput::Printable(c),
                    None => KeyInput::Other,
                }
            }
        }
    }

    /// US ANSI keycode -> character mapping.
    ///
    /// CGEventKeyboardGetUnicodeString is not exposed by the core-graphics
    /// crate, so this static table covers the printable ANSI keys; anything
    /// outside it is classified as Other.
    fn printable_for(key_code: i64, shifted: bool) -> Option<char> {
        let pair = match key_code {
            0 => ('a', 'A'),
            1 => ('s', 'S'),
            2 => ('d', 'D'),
            3 => ('f', 'F'),
            4 => ('h', 'H'),
            5 => ('g', 'G'),
            6 => ('z', 'Z'),
            7 => ('x', 'X'),
            8 => ('c', 'C'),
            9 => ('v', 'V'),
            11 => ('b', 'B'),
            12 => ('q', 'Q'),
            13 => ('w', 'W'),
            14 => ('e', 'E'),
            15 => ('r', 'R'),
            16 => ('y', 'Y'),
            17 => ('t', 'T'),
            18 => ('1', '!'),
            19 => ('2', '@'),
            20 => ('3', '#'),
            21 => ('4', '$'),
            22 => ('6', '^'),
            23 => ('5', '%'),
            24 => ('=', '+'),
            25 => ('9', '('),
            26 => ('7', '&'),
            27 => ('-', '_'),
            28 => ('8', '*'),
            29 => ('0', ')'),
            30 => (']', '}'),
            31 => ('o', 'O'),
            32 => ('u', 'U'),
            33 => ('[', '{'),
            34 => ('i', 'I'),
            35 => ('p', 'P'),
            37 => ('l', 'L'),
            38 => ('j', 'J'),
            39 => ('\'', '"'),
            40 => ('k', 'K'),
            41 => (';', ':'),
            42 => ('\\', '|'),
            43 => (',', '<'),
            44 => ('/', '?'),
            45 => ('n', 'N'),
            46 => ('m', 'M'),
            47 => ('.', '>'),
            50 => ('`', '~'),
            // Keypad digits
            82 => ('0', '0'),
            83 => ('1', '1'),
            84 => ('2', '2'),
            85 => ('3', '3'),
            86 => ('4', '4'),
            87 => ('5', '5'),
            88 => ('6', '6'),
            89 => ('7', '7'),
            91 => ('8', '8'),
            92 => ('9', '9'),
            _ => return None,
        };
        Some(if shifted { pair.1 } else { pair.0 })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn channel_source_delivers_events_in_order() {
        let (tx, source) = ChannelKeySource::new();
        let stop = Arc::new(AtomicBool::new(false));
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();

        let handler: KeyHandler = Box::new(move |key| {
            let _ = seen_tx.send(key);
        });

        let stop_clone = Arc::clone(&stop);
        let consumer = thread::spawn(move || source.run(handler, stop_clone));

        tx.send(KeyInput::Printable('a')).unwrap();
        tx.send(KeyInput::Space).unwrap();
        tx.send(KeyInput::Enter).unwrap();

        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            KeyInput::Printable('a')
        );
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            KeyInput::Space
        );
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            KeyInput::Enter
        );

        stop.store(true, Ordering::Relaxed);
        consumer.join().unwrap().unwrap();
    }

    #[test]
    fn channel_source_exits_when_sender_dropped() {
        let (tx, source) = ChannelKeySource::new();
        let stop = Arc::new(AtomicBool::new(false));

        let handler: KeyHandler = Box::new(|_| {});
        let consumer = thread::spawn(move || source.run(handler, stop));

        drop(tx);
        consumer.join().unwrap().unwrap();
    }

    #[test]
    fn channel_source_exits_on_stop_flag() {
        let (_tx, source) = ChannelKeySource::new();
        let stop = Arc::new(AtomicBool::new(true));

        let handler: KeyHandler = Box::new(|_| {});
        // Stop flag already set: run returns without consuming anything.
        source.run(handler, stop).unwrap();
    }
}
