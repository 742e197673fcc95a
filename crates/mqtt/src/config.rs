//! Transport tuning shared by every handle a connector opens.
//!
//! Per-connection settings (client id, servers, keep-alive, credentials, will)
//! come from the script and live in [`HandleOptions`](crate::HandleOptions).
//! Everything here is process-level: it is loaded once from the `[network]`
//! section of the configuration file and validated with the `validator` crate.
//!
//! ```toml
//! [network]
//! max_inflight = 100
//! request_channel_capacity = 64
//! disconnect_timeout_ms = 250
//!
//! [network.reconnect]
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! multiplier = 1.5
//!
//! [network.tls]
//! ca_cert_path = "/etc/loadmq/ca.pem"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Transport-level settings applied to every connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum number of unacknowledged QoS 1/2 publishes per connection.
    ///
    /// Once reached, rumqttc stops pulling requests from the request channel
    /// until an acknowledgement frees a slot.
    #[validate(range(min = 1, message = "max_inflight must be at least 1"))]
    pub max_inflight: u16,

    /// Capacity of the channel between the handle and its connection driver.
    ///
    /// Requests issued while the channel is full wait for space.
    #[validate(range(
        min = 1,
        max = 65535,
        message = "request_channel_capacity must be between 1 and 65535"
    ))]
    pub request_channel_capacity: usize,

    /// Maximum incoming and outgoing packet size in bytes.
    ///
    /// `None` keeps the rumqttc default (10 KiB).
    #[validate(range(min = 128, message = "max_packet_size must be at least 128 bytes"))]
    pub max_packet_size: Option<usize>,

    /// How long `disconnect` waits for the DISCONNECT packet to be flushed.
    #[validate(range(max = 60000, message = "disconnect_timeout_ms must not exceed 60000"))]
    pub disconnect_timeout_ms: u64,

    /// Automatic reconnection schedule used after an established connection drops.
    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    /// Certificates used for `ssl://`, `tls://` and `mqtts://` servers.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_inflight: 100,
            request_channel_capacity: 64,
            max_packet_size: None,
            disconnect_timeout_ms: 250,
            reconnect: ReconnectConfig::default(),
            tls: None,
        }
    }
}

/// Reconnect delays, see [`Backoff`](crate::Backoff).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a connection loss, in milliseconds.
    #[validate(range(min = 1, message = "initial_delay_ms must be at least 1"))]
    pub initial_delay_ms: u64,

    /// Cap for a single delay, in milliseconds.
    #[validate(range(min = 1, message = "max_delay_ms must be at least 1"))]
    pub max_delay_ms: u64,

    /// Growth factor between attempts.
    #[validate(range(min = 1.0, max = 10.0, message = "multiplier must be between 1.0 and 10.0"))]
    pub multiplier: f64,

    /// Explicit attempt limit. When unset, the limit is the number of attempts
    /// needed to reach `max_delay_ms`.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 1.5,
            max_attempts: None,
        }
    }
}

/// TLS certificate paths.
///
/// Files are checked for existence at validation time and read when a TLS
/// server is dialed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM CA certificate used to verify the broker. Required for TLS servers.
    #[validate(custom(function = "validate_file_exists"))]
    pub ca_cert_path: Option<String>,

    /// PEM client certificate for mutual TLS. Must be paired with `client_key_path`.
    #[validate(custom(function = "validate_file_exists"))]
    pub client_cert_path: Option<String>,

    /// PEM private key for mutual TLS. Must be paired with `client_cert_path`.
    #[validate(custom(function = "validate_file_exists"))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    /// Creates a configuration that only verifies the broker.
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    /// Returns true when both halves of a client identity are configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Checks the cross-field rules `validator` attributes cannot express.
    pub fn validate_pairing(&self) -> Result<(), ValidationError> {
        if self.ca_cert_path.is_none() {
            return Err(ValidationError::new("missing_ca")
                .with_message("TLS requires ca_cert_path".into()));
        }
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ValidationError::new("unpaired_client_auth").with_message(
                "client_cert_path and client_key_path must be set together".into(),
            ));
        }
        Ok(())
    }
}

fn validate_file_exists(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_inflight_is_rejected() {
        let config = NetworkConfig {
            max_inflight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiplier_out_of_range_is_rejected() {
        let config = NetworkConfig {
            reconnect: ReconnectConfig {
                multiplier: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_missing_file_is_rejected() {
        let config = NetworkConfig {
            tls: Some(TlsConfig::with_ca_only("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_existing_file_is_accepted() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        let tls = TlsConfig::with_ca_only(file.path().to_string_lossy());
        assert!(tls.validate().is_ok());
        assert!(tls.validate_pairing().is_ok());
        assert!(!tls.has_client_auth());
    }

    #[test]
    fn test_tls_unpaired_client_auth() {
        let tls = TlsConfig {
            ca_cert_path: Some("ca.pem".into()),
            client_cert_path: Some("client.pem".into()),
            client_key_path: None,
        };
        assert!(tls.validate_pairing().is_err());
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let config: NetworkConfig = toml::from_str(
            r#"
            max_inflight = 10
            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.max_inflight, 10);
        assert_eq!(config.request_channel_capacity, 64);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
    }
}
