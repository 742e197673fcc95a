//! Global `tracing` subscriber setup.
//!
//! `LoggerManager` validates a [`LoggerConfig`] and installs a console layer
//! in the configured format. `RUST_LOG` takes precedence over the configured
//! level. Hosts that install their own subscriber simply skip this.

use std::io;

use thiserror::Error;
use tracing_subscriber::{
    fmt, fmt::format::FmtSpan, prelude::*, util::TryInitError, EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig},
    print_warn,
};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// A global subscriber was already installed.
    #[error("Logger initialization error: {0}")]
    InitializationError(#[from] TryInitError),

    #[error("No logging layers were configured")]
    NoLayersConfigured,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once, before the first client is created.
    ///
    /// # Errors
    ///
    /// `NoLayersConfigured` when console output is disabled, and
    /// `InitializationError` when another subscriber is already installed.
    pub fn init(&self) -> Result<(), LoggerError> {
        let layer = match &self.config.console {
            Some(console) if console.enabled => Self::console_layer(console, self.filter()),
            _ => {
                print_warn!("Console logging is disabled, no subscriber installed");
                return Err(LoggerError::NoLayersConfigured);
            }
        };

        tracing_subscriber::registry().with(layer).try_init()?;
        Ok(())
    }

    fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
        let spans = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(spans)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
        }
    }
}
