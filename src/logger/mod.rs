//! Logger Module
//!
//! A logging system based on `tracing-subscriber` with support for:
//! - Console output with color control
//! - File output with multiple formats (Full, Compact, JSON)
//! - Runtime level changes through [`LogLevelHandle`]

pub mod config;
pub mod error;
pub(crate) mod writer;


pub use config::*;
pub use error::LoggerError;

use std::io::IsTerminal;
use std::sync::Arc;

use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};
use writer::LogFileWriter;

/// Changes the active filter of the global subscriber at runtime.
#[derive(Clone)]
pub struct LogLevelHandle {
    pub(crate) inner: Arc<reload::Handle<EnvFilter, Registry>>,
}

impl LogLevelHandle {
    /// Replaces the filter with `level`, a level name or `EnvFilter` directives.
    pub fn set_level(&self, level: &str) -> Result<(), LoggerError> {
        let filter = EnvFilter::try_new(level).map_err(|e| LoggerError::filter(e.to_string()))?;
        self.inner
            .reload(filter)
            .map_err(|e| LoggerError::reload(e.to_string()))
    }

    pub fn current_level(&self) -> Option<String> {
        self.inner.with_current(|filter| filter.to_string()).ok()
    }
}

/// Initialize the global subscriber with the given configuration
pub fn init_logger(config: LoggerConfig) -> anyhow::Result<LogLevelHandle> {
    config.validate()?;

    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    let handle = LogLevelHandle {
        inner: Arc::new(handle),
    };

    let is_tty = std::io::stdout().is_terminal();
    let use_ansi = config.console.colored && is_tty;
    let console_enabled = config.console.enabled;
    fn console_layer<S>(enabled: bool, use_ansi: bool) -> Option<fmt::Layer<S>> {
        enabled.then(|| {
            fmt::layer()
                .with_ansi(use_ansi)
                .with_target(true)
                .with_level(true)
        })
    }

    let writer = if config.file.enabled {
        Some(LogFileWriter::new(&config.file)?)
    } else {
        None
    };

    // The file layer goes first so console ANSI settings never leak into
    // span fields written to the file.
    let registry = tracing_subscriber::registry().with(filter);
    match config.file.format {
        LogFormat::Full => {
            let file_layer = writer.map(|w| {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(w)
            });
            registry.with(file_layer).with(console_layer(console_enabled, use_ansi)).try_init()?;
        }
        LogFormat::Compact => {
            let file_layer = writer.map(|w| {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .compact()
                    .with_writer(w)
            });
            registry.with(file_layer).with(console_layer(console_enabled, use_ansi)).try_init()?;
        }
        LogFormat::Json => {
            let file_layer = writer.map(|w| fmt::layer().with_ansi(false).json().with_writer(w));
            registry.with(file_layer).with(console_layer(console_enabled, use_ansi)).try_init()?;
        }
    }

    Ok(handle)
}
