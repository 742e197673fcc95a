//! Error type for connection handles and their waitable results.
//!
//! `NetworkError` is what a [`Token`](crate::Token) resolves with when the
//! broker, the transport, or the local client refuses to complete a request.
//! It aggregates three sources:
//!
//! **Setup errors** (detected before any packet leaves the process):
//! - `InvalidServer`: the server address cannot be parsed or uses an unknown scheme
//! - `ClientSetup`: TLS material missing or unreadable
//! - `Io`: certificate file I/O
//!
//! **Protocol errors** (reported by the broker):
//! - `SubscribeRejected`: SUBACK carried a failure return code
//! - `Connection`: CONNACK refused, or any other rumqttc connection error
//!
//! **Lifecycle errors** (the handle went away under a pending request):
//! - `ConnectionLost`, `ConnectionClosed`, `NotConnected`, `ConnectTimeout`
//!
//! The binding layer wraps every one of these into its own script-facing error,
//! so `Display` is written for end users and keeps the innermost cause visible.

use std::time::Duration;

use thiserror::Error;

use super::backoff::BackoffError;

/// Failure reported by a connection handle or one of its waitables.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Server address is malformed or uses an unsupported scheme.
    ///
    /// Accepted forms are `tcp://`, `mqtt://`, `ssl://`, `tls://` and `mqtts://`
    /// followed by a host and an optional port.
    #[error("Invalid server address: {0}")]
    InvalidServer(String),

    /// The rumqttc client could not be assembled.
    ///
    /// Raised when a TLS server is requested without a CA certificate, or when
    /// the configured certificate files fail validation.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Reading certificate material from disk failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The local request channel refused the request.
    ///
    /// Usually means the connection driver has already stopped.
    #[error("Request error: {0}")]
    Request(#[from] rumqttc::ClientError),

    /// The connection to the broker failed or was refused.
    ///
    /// Boxed to keep the enum small; rumqttc's error is large.
    #[error("Connection error: {0}")]
    Connection(#[from] Box<rumqttc::ConnectionError>),

    /// No CONNACK arrived before the connect timeout expired.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker answered a SUBSCRIBE with a failure return code.
    #[error("Subscription to '{topic}' rejected by broker")]
    SubscribeRejected { topic: String },

    /// The connection dropped while the request was waiting for its acknowledgement.
    #[error("Connection lost before acknowledgement")]
    ConnectionLost,

    /// The handle was disconnected or dropped with the request still pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The handle has no live session to send the request on.
    #[error("Not connected")]
    NotConnected,

    /// The handle was opened without any candidate server.
    #[error("No servers to connect to")]
    NoServers,

    /// Automatic reconnection gave up.
    #[error("Reconnect policy error: {0}")]
    ReconnectPolicy(#[from] BackoffError),
}

impl From<rumqttc::ConnectionError> for NetworkError {
    fn from(value: rumqttc::ConnectionError) -> Self {
        NetworkError::Connection(Box::new(value))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_rejected_display() {
        let err = NetworkError::SubscribeRejected {
            topic: "test/denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "Subscription to 'test/denied' rejected by broker"
        );
    }

    #[test]
    fn test_connection_error_is_boxed() {
        let err: NetworkError = rumqttc::ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::BadUserNamePassword,
        )
        .into();
        assert!(matches!(err, NetworkError::Connection(_)));
        assert!(err.to_string().starts_with("Connection error:"));
    }

    #[test]
    fn test_timeout_display() {
        let err = NetworkError::ConnectTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Connect timed out after 1.5s");
    }

    #[test]
    fn test_io_conversion() {
        let err: NetworkError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "ca.pem missing").into();
        assert!(matches!(err, NetworkError::Io(_)));
        assert!(err.to_string().contains("ca.pem missing"));
    }
}
