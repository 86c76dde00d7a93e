//! # Observability Infrastructure
//!
//! Structured logging for the credential lease manager.

pub mod logging;

pub use logging::{fields, log_options_info};

use crate::config::LoggingConfig;
use crate::errors::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Returns an error when a
/// subscriber is already installed instead of panicking.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let result = if config.json_logging {
        fmt().with_env_filter(filter).json().with_current_span(true).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    result.map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(
        log_level = %config.log_level,
        json_logging = %config.json_logging,
        "Logging initialized"
    );
    Ok(())
}
