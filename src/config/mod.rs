//! Configuration loading and validation.
//!
//! [`Config`] aggregates the logger, client defaults and network settings.
//! A host embedding the binding loads it once and hands it to
//! [`Module::new`](crate::core::Module::new); the core never reads files itself.
//!
//! ```toml
//! [logger]
//! level = "debug"
//!
//! [client]
//! task_queue_capacity = 128
//! connect_timeout_ms = 5000
//!
//! [network.reconnect]
//! initial_delay_ms = 500
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

pub use loadmq_mqtt::NetworkConfig;

pub use self::{client::ClientConfig, logger::LoggerConfig};

pub mod client;
pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "LOADMQ_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/loadmq/config.toml";

/// Prints a timestamped line before the tracing subscriber exists.
#[doc(hidden)]
#[macro_export]
macro_rules! __print_line {
    ($level:expr, $($arg:tt)*) => {
        println!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            $level,
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::__print_line!(console::style("INFO").green(), $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::__print_line!(console::style("WARN").yellow(), $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::__print_line!(console::style("ERROR").red(), $($arg)*) };
}

/// Errors raised while locating, parsing or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Defaults applied to every client the module creates.
    #[validate(nested)]
    pub client: ClientConfig,

    /// rumqttc connection settings.
    #[validate(nested)]
    pub network: NetworkConfig,
}

impl Config {
    /// Locates the configuration file and loads it. Falls back to defaults when
    /// no file exists at all.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a file was found but cannot be read, parsed
    /// or validated, or if `LOADMQ_CONFIG` points at a missing file.
    pub fn new() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) => Self::load(&path),
            None => {
                print_info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Priority: `LOADMQ_CONFIG`, then `/etc/loadmq/config.toml`.
    fn config_path() -> Option<PathBuf> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Some(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        fallback.exists().then(|| fallback.to_path_buf())
    }

    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
