//! Autotext watcher - system-wide trigger detection and text substitution.
//!
//! This library implements the background half of a snippet manager: it keeps
//! a trigger -> replacement dictionary in sync with the snippet backend,
//! watches global keyboard input for a registered trigger being typed, and
//! replaces the trigger text with its snippet via backspace + clipboard paste.

pub mod config;
pub mod dictionary;
pub mod error;
pub mod injector;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod source;
pub mod sync;
pub mod watcher;

pub use config::WatcherConfig;
pub use dictionary::{DictionaryCache, DictionaryDiff, TriggerMap};
pub use error::{InjectError, WatcherError};
pub use matcher::{KeyInput, TriggerMatch, TriggerMatcher};
pub use source::{DictionarySource, FetchError, HttpDictionarySource};
pub use watcher::{Watcher, WatcherHandle, WatcherState};
