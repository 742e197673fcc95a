//! Per-connection settings supplied by the caller when a handle is opened.

use std::{fmt, str::FromStr, time::Duration};

use bytes::Bytes;
use rumqttc::QoS;
use url::{Host, Url};

use super::error::NetworkError;

/// Transport selected by a server address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `tcp://` or `mqtt://`
    Tcp,
    /// `ssl://`, `tls://` or `mqtts://`
    Tls,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        }
    }
}

/// A parsed broker address such as `mqtt://localhost:1883`.
///
/// `Display` returns the address exactly as it was supplied, which is what
/// metric tags report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    raw: String,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ServerUrl {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for ServerUrl {
    type Err = NetworkError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let url =
            Url::parse(raw).map_err(|e| NetworkError::InvalidServer(format!("{raw}: {e}")))?;

        let scheme = match url.scheme() {
            "tcp" | "mqtt" => Scheme::Tcp,
            "ssl" | "tls" | "mqtts" => Scheme::Tls,
            other => {
                return Err(NetworkError::InvalidServer(format!(
                    "{raw}: unsupported scheme '{other}'"
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(NetworkError::InvalidServer(format!("{raw}: missing host"))),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
        })
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Username/password pair sent in CONNECT.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Message the broker publishes on the client's behalf after an unclean disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a handle needs to establish one logical connection.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Client identifier. An empty id is replaced by a random UUID when the
    /// handle is opened.
    pub client_id: String,

    /// Candidate servers, tried in order until one accepts the connection.
    pub servers: Vec<ServerUrl>,

    /// Keep-alive interval; whole seconds, zero disables keep-alive.
    pub keep_alive: Duration,

    /// Ask the broker to discard session state on connect.
    pub clean_session: bool,

    pub credentials: Option<Credentials>,

    pub will: Option<Will>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            servers: Vec::new(),
            keep_alive: Duration::from_secs(60),
            clean_session: false,
            credentials: None,
            will: None,
        }
    }
}

/// An application message delivered to the on-message hook.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub pkid: u16,
}

/// Maps a numeric QoS level onto the protocol enum.
pub fn qos_from_u8(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
