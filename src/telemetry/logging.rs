//! Logging setup
//!
//! One tracing subscriber: console output (compact text or JSON) plus an
//! optional non-blocking log file.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when neither `STREAM_TEXTURE_LOG` nor `RUST_LOG` is set
    pub default_level: String,
    /// Emit JSON lines on the console instead of compact text
    pub json_format: bool,
    /// Also write plain-text logs to this file
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            json_format: false,
            file_path: None,
        }
    }
}

impl LogConfig {
    /// Defaults overridden by `STREAM_TEXTURE_LOG_FORMAT=json` and
    /// `STREAM_TEXTURE_LOG_FILE=<path>`
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("STREAM_TEXTURE_LOG_FORMAT").ok(),
            std::env::var("STREAM_TEXTURE_LOG_FILE").ok(),
        )
    }

    fn from_vars(format: Option<String>, file: Option<String>) -> Self {
        Self {
            json_format: format.is_some_and(|v| v.eq_ignore_ascii_case("json")),
            file_path: file.filter(|p| !p.is_empty()).map(PathBuf::from),
            ..Self::default()
        }
    }
}

/// Install the global subscriber.
///
/// With a log file configured, the returned guard must outlive all logging
/// so buffered lines reach the file.
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_env("STREAM_TEXTURE_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    // Frames cross from the reassembler thread to the owner, so thread names are always on
    let json_layer = config
        .json_format
        .then(|| fmt::layer().json().with_thread_names(true));
    let text_layer = (!config.json_format).then(|| fmt::layer().compact().with_thread_names(true));

    let (file_layer, guard) = match &config.file_path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        json = config.json_format,
        file = ?config.file_path,
        "Logging initialized"
    );

    Ok(guard)
}
