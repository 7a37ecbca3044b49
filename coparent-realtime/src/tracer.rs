//! Global `tracing` subscriber setup.

use shared::config::{LogFormat, LoggingConfig};
use tracing::debug;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt};

/// Installs the process-wide subscriber described by `logging`.
///
/// `RUST_LOG` wins over the configured level when it is set. Returns the
/// configured level so callers can report it.
pub fn initialize_tracing(logging: &LoggingConfig) -> String {
    let builder = fmt::fmt()
        .with_env_filter(build_env_filter(logging))
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(logging.format, LogFormat::Json) {
        builder.json().with_ansi(false).try_init()
    } else {
        builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        debug!("tracing subscriber already installed; keeping it");
    }

    logging.level.clone()
}

fn build_env_filter(logging: &LoggingConfig) -> EnvFilter {
    let default_level = logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}
