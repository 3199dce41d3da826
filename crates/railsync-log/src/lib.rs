//! Logging for railsync nodes.
//!
//! Human-readable console output with uptime timestamps, plus an optional
//! JSON file for going through a multiplayer session afterwards. `RUST_LOG`
//! always wins over the configured level.

use std::fs::File;
use std::path::Path;

use railsync_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// JSON log written into the log directory.
pub const LOG_FILE_NAME: &str = "railsync.log";

/// Filter directive taken from the config's `debug.log_level`.
pub fn configured_directive(config: Option<&Config>) -> &str {
    config
        .map(|c| c.debug.log_level.trim())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER)
}

/// `RUST_LOG` if set and valid, the configured directive otherwise.
pub fn session_filter(config: Option<&Config>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_directive(config)))
}

/// Create `log_dir` and truncate the JSON log inside it.
fn open_log_file(log_dir: &Path) -> std::io::Result<File> {
    std::fs::create_dir_all(log_dir)?;
    File::create(log_dir.join(LOG_FILE_NAME))
}

/// Install the global subscriber. Call once, before the session starts.
///
/// ```no_run
/// railsync_log::init_logging(None, false, None);
/// ```
pub fn init_logging(log_dir: Option<&Path>, file_logging: bool, config: Option<&Config>) {
    let console = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime());
    let registry = tracing_subscriber::registry()
        .with(session_filter(config))
        .with(console);

    let file = match log_dir.filter(|_| file_logging).map(open_log_file) {
        Some(Ok(file)) => Some(file),
        Some(Err(e)) => {
            eprintln!("railsync: file logging disabled: {e}");
            None
        }
        None => None,
    };

    match file {
        Some(file) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_timer(fmt::time::uptime()),
            )
            .init(),
        None => registry.init(),
    }
}
