//! Log subscriber setup.
//!
//! ```rust,no_run
//! use sluice::config::LoggingConfig;
//!
//! sluice::logging::init(&LoggingConfig::default());
//! ```

use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Installs the global subscriber. Keeps the existing one if one is already
/// installed.
pub fn init(config: &LoggingConfig) {
    if let Err(e) = try_init(config) {
        tracing::debug!(error = %e, "keeping the installed log subscriber");
    }
}

/// Installs the global subscriber, failing if one is already installed.
pub fn try_init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
    }
}
