//! # loadmq-mqtt: rumqttc connection handles with waitable acknowledgements
//!
//! This crate is the network side of the `loadmq` binding. It wraps `rumqttc`
//! behind a small, object-safe interface so the binding can own exactly one
//! live connection at a time and swap it out under a lock:
//!
//! - **[`NetworkHandle`]**: one logical connection with `connect`, `disconnect`,
//!   `publish`, `subscribe` and `unsubscribe`
//! - **[`Token`]**: every request returns one immediately; awaiting it yields
//!   the broker's verdict
//! - **[`Hooks`]**: on-connect, on-reconnect and on-message callbacks invoked
//!   from the background driver
//! - **[`Connector`]**: the factory the binding uses, replaceable in tests
//!
//! # Quick Start
//!
//! ```ignore
//! use loadmq_mqtt::{Connector, HandleOptions, Hooks, RumqttConnector, QoS};
//!
//! let options = HandleOptions {
//!     servers: vec!["mqtt://localhost:1883".parse()?],
//!     ..Default::default()
//! };
//! let hooks = Hooks::default().on_message(|msg| println!("{}", msg.topic));
//!
//! let handle = RumqttConnector::default().open(options, hooks)?;
//! handle.connect().await.wait().await?;
//! handle.subscribe("sensors/#", QoS::AtLeastOnce).await.wait().await?;
//! handle.publish("sensors/a", QoS::AtLeastOnce, false, "22.5".into()).await.wait().await?;
//! handle.disconnect().await;
//! ```
//!
//! # Acknowledgements
//!
//! rumqttc exposes no per-request completion, so the driver correlates
//! outgoing packet ids with incoming acks:
//!
//! ```text
//! publish(QoS 0)  ──► Outgoing::Publish   ──► resolved
//! publish(QoS 1)  ──► Outgoing::Publish   ──► PubAck   ──► resolved
//! publish(QoS 2)  ──► Outgoing::Publish   ──► PubComp  ──► resolved
//! subscribe       ──► Outgoing::Subscribe ──► SubAck   ──► resolved / SubscribeRejected
//! unsubscribe     ──► Outgoing::Unsubscribe ► UnsubAck ──► resolved
//! ```
//!
//! # Reconnection
//!
//! After the first CONNACK the driver keeps the session alive on its own.
//! Transient failures invoke the on-reconnect hook, wait according to
//! [`Backoff`] and poll again; the next CONNACK invokes on-connect. Fatal
//! failures (refused credentials, TLS, protocol violations) stop the driver.
//!
//! # Configuration
//!
//! [`NetworkConfig`] deserializes from the `[network]` TOML section and carries
//! channel sizes, the reconnect policy and optional TLS material.

mod backoff;
mod client;
mod config;
mod connection;
mod error;
mod handle;
mod options;
mod pending;
mod token;

pub use backoff::{Backoff, BackoffError};
pub use client::ClientBuilder;
pub use config::{NetworkConfig, ReconnectConfig, TlsConfig};
pub use error::{NetworkError, Result};
pub use handle::{Connector, Hooks, NetworkHandle, RumqttConnector, RumqttHandle};
pub use options::{qos_from_u8, Credentials, HandleOptions, Message, Scheme, ServerUrl, Will};
pub use token::{Token, Waiter};

pub use rumqttc::QoS;
