//! Tracing setup for the binaries

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `level_override` (from the command line) wins over `config.level`.
/// `RUST_LOG` is ignored once a level is given here.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<(), crate::Error> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_new(level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level {:?}: {}", level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| crate::Error::Config(format!("Failed to open log file {}: {}", path, e)))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match config.format.as_str() {
                "compact" => builder.compact().try_init(),
                _ => builder.pretty().try_init(),
            }
        }
        None => match config.format.as_str() {
            "compact" => builder.compact().try_init(),
            _ => builder.pretty().try_init(),
        },
    };
    installed.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}
