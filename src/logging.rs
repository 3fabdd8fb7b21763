//! Tracing subscriber setup for binaries embedding the pipeline.
//!
//! Call [`init`] once at startup; library code only emits `tracing` events.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::LLMError;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins when set and valid; otherwise `level` (e.g. `"info"` or
/// `"kotoba_chat=debug,tower_http=warn"`) is used.
pub fn init(level: &str) -> Result<(), LLMError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|err| invalid_level(level, err.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| LLMError::InvalidConfig {
            field: "log_level".to_string(),
            reason: format!("failed to set subscriber: {err}"),
        })
}

/// Validates a single level name such as `warn`.
pub fn parse_level(level: &str) -> Result<LevelFilter, LLMError> {
    if level.is_empty() {
        return Err(invalid_level(level, "log level must not be empty"));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| invalid_level(level, "unrecognised log level"))
}

fn invalid_level(level: &str, reason: impl Into<String>) -> LLMError {
    LLMError::InvalidConfig {
        field: "log_level".to_string(),
        reason: format!("{} ({level:?})", reason.into()),
    }
}
