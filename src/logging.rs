use crate::config::LoggingConfig;
use crate::error::{AgentError, AgentResult};
use log::LevelFilter;
use std::str::FromStr;

/// Parse a configured level name such as `info` or `debug`.
pub fn parse_level(level: &str) -> AgentResult<LevelFilter> {
    LevelFilter::from_str(level.trim())
        .map_err(|_| AgentError::Config(format!("Unknown log level: {}", level)))
}

/// Install the process-wide logger.
///
/// The configured level is the default filter; `RUST_LOG` overrides it.
/// Fails if a logger is already installed, so callers that may initialise
/// twice should ignore the result with `.ok()`.
pub fn init(config: &LoggingConfig) -> AgentResult<()> {
    let level = parse_level(&config.level)?;
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    if !config.timestamps {
        builder.format_timestamp(None);
    }
    builder
        .try_init()
        .map_err(|e| AgentError::Config(format!("Failed to initialise logger: {}", e)))
}
