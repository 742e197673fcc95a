//! Errors surfaced to scripts.
//!
//! Three families reach the caller:
//!
//! - **Validation** (`InvalidType`, `InvalidArgument`): malformed arguments,
//!   raised during Prepare before anything touches the network
//! - **Precondition** (`NotConnected`, `NoPreviousConnect`, `Shutdown`): the
//!   client is in the wrong state for the call
//! - **Network** (`Mqtt`): a network operation failed. These are first
//!   offered to the script's `error` handler and only returned when none is
//!   registered.

use std::fmt;

use thiserror::Error;

use crate::runtime::Value;

/// `name` of every [`MqttError`].
pub const MQTT_ERROR_NAME: &str = "MQTTError";

/// A network failure wrapped with the method that caused it.
///
/// Marshals to a script object with `name`, `method` and `message`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("MQTT error during {method}: {message}")]
pub struct MqttError {
    pub name: String,
    pub method: String,
    pub message: String,
}

impl MqttError {
    pub fn new(method: &str, cause: impl fmt::Display) -> Self {
        Self {
            name: MQTT_ERROR_NAME.to_string(),
            method: method.to_string(),
            message: cause.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::object([
            ("name", Value::from(self.name.as_str())),
            ("method", Value::from(self.method.as_str())),
            ("message", Value::from(self.message.as_str())),
        ])
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected")]
    NotConnected,

    #[error("reconnect called before connect")]
    NoPreviousConnect,

    #[error(transparent)]
    Mqtt(#[from] MqttError),

    #[error("credentials provider failed: {0}")]
    Credentials(String),

    /// The client was closed or its execution context ended.
    #[error("client is closed")]
    Shutdown,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Precondition,
    Network,
    Credentials,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidType(_) | Error::InvalidArgument(_) => ErrorKind::Validation,
            Error::NotConnected | Error::NoPreviousConnect | Error::Shutdown => {
                ErrorKind::Precondition
            }
            Error::Mqtt(_) => ErrorKind::Network,
            Error::Credentials(_) => ErrorKind::Credentials,
        }
    }

    pub(crate) fn invalid_type(expected: &str, got: &Value) -> Self {
        Error::InvalidType(format!("{expected} expected, got {}", got.type_name()))
    }

    /// Script-visible representation, as passed to rejection handlers.
    pub fn to_value(&self) -> Value {
        match self {
            Error::Mqtt(err) => err.to_value(),
            other => Value::object([
                ("name", Value::from("Error")),
                ("message", Value::from(other.to_string())),
            ]),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
