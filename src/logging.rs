//! Logging setup
//!
//! Installs the process-wide `tracing` subscriber. `RUST_LOG` takes
//! precedence over the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    /// Another global subscriber is already installed
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        filter: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Initializes the global subscriber.
///
/// # Errors
///
/// Fails on an unparseable level, or when a subscriber is already set
/// (tests and embedding hosts may have installed their own).
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}
