//! Logger setup. The library only emits through `log`; binaries and tests
//! decide whether and where those records go.

use env_logger::{Builder, Target};

use crate::config::{LogConfig, LogSink};
use crate::error::Result;

/// Install an env_logger built from `config`.
///
/// Returns `Ok(false)` when a logger was already installed.
pub fn init(config: &LogConfig) -> Result<bool> {
    let mut builder = builder(config)?;
    Ok(builder.try_init().is_ok())
}

pub fn builder(config: &LogConfig) -> Result<Builder> {
    let mut builder = Builder::new();
    builder.filter_level(config.level_filter()?);
    if let Some(filters) = &config.filters {
        builder.parse_filters(filters);
    }
    builder.target(match config.sink {
        LogSink::Stderr => Target::Stderr,
        LogSink::Stdout => Target::Stdout,
    });
    Ok(builder)
}
