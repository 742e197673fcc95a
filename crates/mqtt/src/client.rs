//! Builder translating [`HandleOptions`] into a rumqttc client for one server.
//!
//! A handle may carry several candidate servers; the connection code builds one
//! `ClientBuilder` per attempt. The builder is responsible for:
//!
//! - **Identity**: client id, credentials, last will
//! - **Session**: keep-alive, clean session, inflight window, packet size
//! - **Transport**: plain TCP or TLS with certificates from [`TlsConfig`]
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::new(&options, &server, &config).build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, TlsConfiguration, Transport};
use tracing::debug;

use super::{
    config::{NetworkConfig, TlsConfig},
    error::{NetworkError, Result},
    options::{HandleOptions, Scheme, ServerUrl},
};

/// Assembles `MqttOptions` and the transport for a single server.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    scheme: Scheme,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Prepares a builder for `server`.
    ///
    /// `options.client_id` must already be non-empty; rumqttc refuses empty ids.
    pub fn new(options: &HandleOptions, server: &ServerUrl, config: &NetworkConfig) -> Self {
        let mut opts = MqttOptions::new(options.client_id.clone(), server.host(), server.port());

        opts.set_keep_alive(Duration::from_secs(options.keep_alive.as_secs()));
        opts.set_clean_session(options.clean_session);
        opts.set_inflight(config.max_inflight);

        if let Some(size) = config.max_packet_size {
            opts.set_max_packet_size(size, size);
        }

        if let Some(creds) = &options.credentials {
            opts.set_credentials(creds.username.clone(), creds.password.clone());
        }

        if let Some(will) = &options.will {
            opts.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.to_vec(),
                will.qos,
                will.retain,
            ));
        }

        debug!(
            client_id = %options.client_id,
            server = %server,
            clean_session = options.clean_session,
            "Prepared MQTT client options"
        );

        Self {
            opts,
            cap: config.request_channel_capacity,
            scheme: server.scheme(),
            tls_config: config.tls.clone(),
        }
    }

    fn load_file(path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    /// Reads the configured certificates into a rumqttc TLS transport.
    ///
    /// # Errors
    /// `ClientSetup` when no CA is configured or the client certificate and key
    /// are not paired; `Io` when a file cannot be read.
    fn build_tls_transport(&self) -> Result<Transport> {
        let tls_config = self.tls_config.as_ref().ok_or_else(|| {
            NetworkError::ClientSetup("TLS server requires [network.tls] configuration".into())
        })?;

        tls_config
            .validate_pairing()
            .map_err(|e| NetworkError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca = match &tls_config.ca_cert_path {
            Some(path) => Self::load_file(path)?,
            None => return Err(NetworkError::ClientSetup("TLS requires ca_cert_path".into())),
        };

        let client_auth = match (&tls_config.client_cert_path, &tls_config.client_key_path) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Creates the client and its event loop. Nothing is dialed until the event
    /// loop is polled.
    pub fn build(self) -> Result<(AsyncClient, EventLoop)> {
        let transport = match self.scheme {
            Scheme::Tcp => Transport::Tcp,
            Scheme::Tls => self.build_tls_transport()?,
        };

        let mut opts = self.opts;
        opts.set_transport(transport);

        Ok(AsyncClient::new(opts, self.cap))
    }
}
