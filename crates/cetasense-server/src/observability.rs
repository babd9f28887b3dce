//! Tracing setup.
//!
//! The subscriber is installed before configuration is read so config errors
//! are logged; the configured `logging.level` is swapped in afterwards. A
//! `RUST_LOG` present at startup pins the filter and config is ignored.

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

/// Handle on the installed log filter.
#[derive(Clone)]
pub struct LogFilter {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
}

impl LogFilter {
    /// Switch to the configured level.
    pub fn apply(&self, logging: &LoggingConfig) {
        if self.pinned {
            tracing::debug!(level = %logging.level, "RUST_LOG is set, ignoring logging.level");
            return;
        }
        match self.handle.reload(level_filter(&logging.level)) {
            Ok(()) => tracing::debug!(level = %logging.level, "log level applied"),
            Err(e) => tracing::warn!(error = %e, "failed to apply log level"),
        }
    }
}

pub fn init_tracing(logging: &LoggingConfig) -> LogFilter {
    let from_env = std::env::var_os(EnvFilter::DEFAULT_ENV)
        .and_then(|_| EnvFilter::try_from_default_env().ok());
    let pinned = from_env.is_some();
    let filter = from_env.unwrap_or_else(|| level_filter(&logging.level));

    let (filter, handle) = reload::Layer::new(filter);
    // A subscriber may already exist (tests); keep it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();

    LogFilter { handle, pinned }
}

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
