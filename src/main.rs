//! autotext-watcher binary: run the trigger-detection watcher against the
//! snippet backend until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use autotext_watcher::config::{self, WatcherConfig};
use autotext_watcher::injector::TextInjector;
use autotext_watcher::logging;
use autotext_watcher::monitor;
use autotext_watcher::source::HttpDictionarySource;
use autotext_watcher::watcher::Watcher;

/// Trigger-detection and text-substitution watcher for the snippet manager.
#[derive(Parser, Debug)]
#[command(name = "autotext-watcher", version, about)]
struct Args {
    /// Config file path (default: ~/.autotext/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL of the snippet backend (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Periodic refresh interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Log added/removed/changed triggers on every refresh
    #[arg(long)]
    verbose_diffs: bool,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
fn install_signal_handlers() {
    extern "C" fn on_signal(_signum: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {
    // No graceful-shutdown signal on this platform; the watcher runs until
    // the process is killed.
}

fn main() -> Result<()> {
    let _guard = logging::init();
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let mut config: WatcherConfig = config::load_config(&config_path);

    if let Some(url) = args.url {
        config.base_url = url;
    }
    if let Some(interval) = args.interval {
        config.refresh_interval_secs = interval;
    }
    if args.verbose_diffs {
        config.verbose_diffs = true;
    }

    info!(
        base_url = %config.base_url,
        interval_secs = config.refresh_interval_secs,
        "Configuration resolved"
    );

    let source = Arc::new(HttpDictionarySource::new(&config.base_url));
    let injector = Arc::new(TextInjector::new(config.settle_delay()));

    let key_source = match monitor::system_key_source() {
        Ok(source) => Some(source),
        Err(e) => {
            error!(error = %e, "No keyboard hook on this platform; dictionary sync only");
            None
        }
    };

    let watcher = Watcher::new(config, source, injector, key_source);
    watcher.start()?;

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Shutdown signal received");
    watcher.stop();
    Ok(())
}
