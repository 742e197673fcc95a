//! Connection handles: the boundary between the binding and the MQTT library.
//!
//! A [`NetworkHandle`] represents one logical connection. Every operation
//! returns a [`Token`] as soon as the request has been queued; awaiting the
//! token waits for the broker's acknowledgement. Protocol-level events are
//! reported through [`Hooks`], invoked from the connection driver task:
//!
//! - **on-connect**: every successful CONNACK, including after automatic reconnects
//! - **on-reconnect**: before each automatic reconnection attempt
//! - **on-message**: every application message received
//!
//! [`Connector`] creates handles. [`RumqttConnector`] is the production
//! implementation backed by rumqttc; tests substitute their own.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    backoff::Backoff,
    client::ClientBuilder,
    config::NetworkConfig,
    connection::ConnectionKernel,
    error::{NetworkError, Result},
    options::{HandleOptions, Message, ServerUrl},
    pending::PendingRequests,
    token::Token,
};

type Hook = Arc<dyn Fn() + Send + Sync>;
type MessageHook = Arc<dyn Fn(Message) + Send + Sync>;

/// Callbacks a handle invokes from its background driver.
///
/// Hooks run on the network task and must not block for long.
#[derive(Clone, Default)]
pub struct Hooks {
    on_connect: Option<Hook>,
    on_reconnect: Option<Hook>,
    on_message: Option<MessageHook>,
}

impl Hooks {
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Invokes the on-connect hook, if any.
    pub fn connected(&self) {
        if let Some(f) = &self.on_connect {
            f();
        }
    }

    /// Invokes the on-reconnect hook, if any.
    pub fn reconnecting(&self) {
        if let Some(f) = &self.on_reconnect {
            f();
        }
    }

    /// Invokes the on-message hook, if any.
    pub fn message(&self, message: Message) {
        if let Some(f) = &self.on_message {
            f(message);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_reconnect", &self.on_reconnect.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

/// One logical connection to a broker.
#[async_trait]
pub trait NetworkHandle: Send + Sync {
    /// Client identifier sent in CONNECT.
    fn client_id(&self) -> &str;

    /// First candidate server, as supplied.
    fn server_url(&self) -> &str;

    /// True while a CONNACK-confirmed session is up.
    fn is_connected(&self) -> bool;

    /// Starts connecting; the token settles once a server accepted or all refused.
    async fn connect(&self) -> Token;

    /// Sends DISCONNECT if connected and stops the driver.
    async fn disconnect(&self);

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> Token;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Token;

    async fn unsubscribe(&self, topic: &str) -> Token;
}

/// Factory for connection handles.
pub trait Connector: Send + Sync {
    /// Creates an unconnected handle. Fails only on invalid options.
    fn open(&self, options: HandleOptions, hooks: Hooks) -> Result<Arc<dyn NetworkHandle>>;
}

/// Opens rumqttc-backed handles with a shared [`NetworkConfig`].
#[derive(Debug, Clone, Default)]
pub struct RumqttConnector {
    config: NetworkConfig,
}

impl RumqttConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl Connector for RumqttConnector {
    fn open(&self, mut options: HandleOptions, hooks: Hooks) -> Result<Arc<dyn NetworkHandle>> {
        if options.servers.is_empty() {
            return Err(NetworkError::NoServers);
        }
        if options.client_id.is_empty() {
            options.client_id = uuid::Uuid::new_v4().to_string();
        }

        Ok(Arc::new(RumqttHandle {
            shared: Arc::new(Shared {
                options,
                config: self.config.clone(),
                hooks,
                connected: Arc::new(AtomicBool::new(false)),
                pending: Arc::new(Mutex::new(PendingRequests::default())),
                session: tokio::sync::Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }))
    }
}

/// A live rumqttc client and the task driving it.
struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Shared {
    options: HandleOptions,
    config: NetworkConfig,
    hooks: Hooks,
    connected: Arc<AtomicBool>,
    pending: Arc<Mutex<PendingRequests>>,

    /// Also serializes request submission so waiters queue in channel order.
    session: tokio::sync::Mutex<Option<Session>>,

    /// Parent of every session token; cancelled when the handle is dropped.
    cancel: CancellationToken,
}

impl Shared {
    async fn connect_candidates(&self) -> Result<()> {
        let mut last_error = NetworkError::NoServers;

        for server in &self.options.servers {
            if self.cancel.is_cancelled() {
                return Err(NetworkError::ConnectionClosed);
            }

            match self.open_session(server).await {
                Ok(session) => {
                    info!(
                        server = %server,
                        client_id = %self.options.client_id,
                        "Connected to broker"
                    );
                    let previous = self.session.lock().await.replace(session);
                    if let Some(previous) = previous {
                        previous.cancel.cancel();
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Connection attempt failed");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn open_session(&self, server: &ServerUrl) -> Result<Session> {
        let (client, event_loop) =
            ClientBuilder::new(&self.options, server, &self.config).build()?;

        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.child_token();
        let kernel = ConnectionKernel::new(
            event_loop,
            self.pending.clone(),
            self.hooks.clone(),
            self.connected.clone(),
            cancel.clone(),
            Backoff::from_config(&self.config.reconnect),
            tx,
        );
        let driver = tokio::spawn(kernel.run());

        match rx.await {
            Ok(Ok(())) => Ok(Session {
                client,
                driver,
                cancel,
            }),
            Ok(Err(e)) => {
                cancel.cancel();
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                Err(NetworkError::ConnectionClosed)
            }
        }
    }
}

/// rumqttc-backed [`NetworkHandle`].
pub struct RumqttHandle {
    shared: Arc<Shared>,
}

impl RumqttHandle {
    fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.config.disconnect_timeout_ms)
    }
}

#[async_trait]
impl NetworkHandle for RumqttHandle {
    fn client_id(&self) -> &str {
        &self.shared.options.client_id
    }

    fn server_url(&self) -> &str {
        self.shared
            .options
            .servers
            .first()
            .map(ServerUrl::as_str)
            .unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Token {
        let (waiter, token) = Token::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            waiter.complete(shared.connect_candidates().await);
        });
        token
    }

    async fn disconnect(&self) {
        let session = self.shared.session.lock().await.take();
        let Some(mut session) = session else {
            return;
        };

        if self.is_connected() {
            match session.client.disconnect().await {
                Ok(()) => {
                    if tokio::time::timeout(self.disconnect_timeout(), &mut session.driver)
                        .await
                        .is_err()
                    {
                        debug!("DISCONNECT not flushed in time, cancelling driver");
                    }
                }
                Err(e) => debug!(error = %e, "Could not queue DISCONNECT"),
            }
        }

        session.cancel.cancel();
        self.shared.connected.store(false, Ordering::Release);
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Bytes) -> Token {
        let (waiter, token) = Token::channel();
        let session = self.shared.session.lock().await;
        let Some(session) = session.as_ref() else {
            waiter.fail(NetworkError::NotConnected);
            return token;
        };

        self.shared.pending.lock().queue_publish(qos, waiter);
        if let Err(e) = session.client.publish(topic, qos, retain, payload.to_vec()).await {
            if let Some(waiter) = self.shared.pending.lock().unqueue_publish() {
                waiter.fail(e.into());
            }
        }
        token
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Token {
        let (waiter, token) = Token::channel();
        let session = self.shared.session.lock().await;
        let Some(session) = session.as_ref() else {
            waiter.fail(NetworkError::NotConnected);
            return token;
        };

        self.shared
            .pending
            .lock()
            .queue_subscribe(topic.to_string(), waiter);
        if let Err(e) = session.client.subscribe(topic, qos).await {
            if let Some(waiter) = self.shared.pending.lock().unqueue_subscribe() {
                waiter.fail(e.into());
            }
        }
        token
    }

    async fn unsubscribe(&self, topic: &str) -> Token {
        let (waiter, token) = Token::channel();
        let session = self.shared.session.lock().await;
        let Some(session) = session.as_ref() else {
            waiter.fail(NetworkError::NotConnected);
            return token;
        };

        self.shared.pending.lock().queue_unsubscribe(waiter);
        if let Err(e) = session.client.unsubscribe(topic).await {
            if let Some(waiter) = self.shared.pending.lock().unqueue_unsubscribe() {
                waiter.fail(e.into());
            }
        }
        token
    }
}

impl Drop for RumqttHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
