//! Script-visible clients and the module that creates them.
//!
//! A [`Client`] owns at most one network handle at a time, an event registry
//! and a dispatcher task. Operations live in sibling modules:
//!
//! - `lifecycle`: `connect`, `reconnect`, `end` and their async variants
//! - `publish`: `publish`, `publishAsync`
//! - `subscribe`: `subscribe`, `unsubscribe` and their async variants
//!
//! Every operation is split into Prepare, which validates on the caller's
//! thread, and Execute, which runs on the shared runtime. Network failures go
//! through [`Inner::handle_error`]: error metrics are always recorded, then the
//! failure is offered to the `error` handler and only returned to the caller
//! when no handler is registered.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use loadmq_mqtt::{Connector, Hooks, Message, NetworkHandle, RumqttConnector};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{
    blocking::{self, run_blocking},
    dispatcher::Dispatcher,
    error::{Error, MqttError, Result},
    events::{EventKind, EventRegistry},
    metrics::{self, merge, MetricsSink, Sample, TagSet},
    options::{ClientOptions, ConnectTarget},
    state::ConnectionState,
};
use crate::{
    config::Config,
    runtime::{Function, Host, Value},
};

/// Entry point for a host: creates clients sharing one configuration,
/// metrics sink and connector.
#[derive(Clone)]
pub struct Module {
    host: Arc<dyn Host>,
    sink: Arc<dyn MetricsSink>,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
}

impl Module {
    /// Uses rumqttc handles configured from `config.network`.
    pub fn new(host: Arc<dyn Host>, sink: Arc<dyn MetricsSink>, config: Config) -> Self {
        let connector = Arc::new(RumqttConnector::new(config.network.clone()));
        Self::with_connector(host, sink, config, connector)
    }

    pub fn with_connector(
        host: Arc<dyn Host>,
        sink: Arc<dyn MetricsSink>,
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            host,
            sink,
            config: Arc::new(config),
            connector,
        }
    }

    /// The `Client` constructor. `options` may be `undefined` or an object
    /// with `clientId`, `username`, `password`, `credentialsProvider`, `will`
    /// and `tags`.
    ///
    /// The dispatcher starts immediately and runs until [`Client::close`] or
    /// until the host context is cancelled.
    pub fn client(&self, options: impl Into<Value>) -> Result<Client> {
        let options = ClientOptions::parse(&options.into())?;
        let dispatcher = Dispatcher::spawn(
            self.host.clone(),
            self.config.client.task_queue_capacity,
        );

        Ok(Client {
            inner: Arc::new(Inner {
                host: self.host.clone(),
                sink: self.sink.clone(),
                config: self.config.clone(),
                connector: self.connector.clone(),
                options,
                last_connect: Mutex::new(None),
                identity: Mutex::new(Identity::default()),
                connecting: AtomicBool::new(false),
                events: EventRegistry::default(),
                dispatcher,
                slot: RwLock::new(None),
            }),
        })
    }
}

/// The current handle and the token that cuts its hooks off from the registry.
pub(super) struct Attached {
    pub(super) handle: Arc<dyn NetworkHandle>,
    pub(super) detach: CancellationToken,
}

/// Identity of the most recent handle, for `client_id` and `url` tags.
#[derive(Debug, Default, Clone)]
pub(super) struct Identity {
    pub(super) client_id: String,
    pub(super) url: String,
}

pub(super) struct Inner {
    pub(super) host: Arc<dyn Host>,
    sink: Arc<dyn MetricsSink>,
    pub(super) config: Arc<Config>,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) options: ClientOptions,

    /// Target of the last `connect`, reused by `reconnect`.
    pub(super) last_connect: Mutex<Option<ConnectTarget>>,
    pub(super) identity: Mutex<Identity>,

    /// Set while a connect or reconnect holds the write lock.
    pub(super) connecting: AtomicBool,
    events: EventRegistry,
    pub(super) dispatcher: Dispatcher,

    /// Replaced under the write lock; operations hold the read lock.
    pub(super) slot: RwLock<Option<Attached>>,
}

/// A script-visible MQTT client. Cloning shares the same client.
#[derive(Clone)]
pub struct Client {
    pub(super) inner: Arc<Inner>,
}

impl Client {
    /// Binds `handler` to `event`, replacing any previous handler.
    /// Unknown event names are ignored.
    pub fn on(&self, event: &str, handler: Function) {
        self.inner.events.register(event, handler);
    }

    /// True when a handle is installed and reports a confirmed session.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The read-only `connected` property.
    pub fn connected(&self) -> bool {
        self.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        if self.inner.connecting.load(Ordering::Acquire) {
            return ConnectionState::Connecting;
        }

        let inner = self.inner.clone();
        run_blocking(async move {
            let slot = inner.slot.read().await;
            match slot.as_ref() {
                Some(attached) => ConnectionState::derive(true, attached.handle.is_connected()),
                None => ConnectionState::derive(false, false),
            }
        })
    }

    /// Stops the dispatcher and drops the current handle. Pending events are
    /// discarded and every later operation fails with `Shutdown`.
    pub fn close(&self) {
        debug!("Closing MQTT client");
        self.inner.dispatcher.stop();

        let inner = self.inner.clone();
        run_blocking(async move {
            let old = inner.slot.write().await.take();
            if let Some(old) = old {
                inner.teardown(old).await;
            }
        });
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.identity.lock().client_id)
            .finish_non_exhaustive()
    }
}

impl Inner {
    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.dispatcher.is_stopped() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    pub(super) fn is_connected(self: &Arc<Self>) -> bool {
        let inner = self.clone();
        run_blocking(async move {
            inner
                .slot
                .read()
                .await
                .as_ref()
                .is_some_and(|attached| attached.handle.is_connected())
        })
    }

    /// Prepare-time check shared by every operation that needs a session.
    pub(super) fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Queues the handler for `kind`, if any. Returns whether it was queued.
    pub(super) fn fire(&self, kind: EventKind, args: Vec<Value>) -> bool {
        let Some(handler) = self.events.get(kind) else {
            return false;
        };
        if self.dispatcher.is_stopped() {
            debug!(event = %kind, "Dispatcher stopped, event not delivered");
            return false;
        }

        debug!(event = %kind, "Queuing event handler");
        self.dispatcher.run(Box::new(move || {
            debug!(event = %kind, "Firing event handler");
            handler.call(&args).map(|_| ())
        }));
        true
    }

    /// Records error metrics and offers the failure to the `error` handler.
    ///
    /// Returns `Ok` when a handler took it, the wrapped error otherwise.
    pub(super) fn handle_error(
        &self,
        err: impl fmt::Display,
        method: &str,
        call_tags: &TagSet,
        pairs: &[(&str, &str)],
    ) -> Result<()> {
        error!(error = %err, method, "MQTT error occurred");
        self.push(vec![Sample::now(
            metrics::MQTT_ERRORS,
            self.method_tags(method, call_tags, pairs),
            1.0,
        )]);

        let wrapped = MqttError::new(method, err);
        if self.fire(EventKind::Error, vec![wrapped.to_value()]) {
            return Ok(());
        }
        Err(wrapped.into())
    }

    /// Tags shared by every sample of this client.
    pub(super) fn tags(&self) -> TagSet {
        let mut tags = self.host.current_tags();
        tags.insert("proto".into(), self.config.client.protocol_tag.clone());

        let identity = self.identity.lock().clone();
        if !identity.client_id.is_empty() {
            tags.insert("client_id".into(), identity.client_id);
        }
        if !identity.url.is_empty() {
            tags.insert("url".into(), identity.url);
        }

        let tags = merge(tags, &self.options.tags);
        match self.last_connect.lock().as_ref() {
            Some(target) => merge(tags, &target.options.tags),
            None => tags,
        }
    }

    pub(super) fn method_tags(
        &self,
        method: &str,
        call_tags: &TagSet,
        pairs: &[(&str, &str)],
    ) -> TagSet {
        let mut tags = self.tags();
        tags.insert("method".into(), method.to_string());
        let mut tags = merge(tags, call_tags);
        for (key, value) in pairs {
            tags.insert(key.to_string(), value.to_string());
        }
        tags
    }

    /// Forwards samples unless the execution context is already done.
    pub(super) fn push(&self, samples: Vec<Sample>) {
        if self.host.context().is_cancelled() {
            return;
        }
        self.sink.push(samples);
    }

    pub(super) fn push_call(&self, method: &str, call_tags: &TagSet, pairs: &[(&str, &str)]) {
        debug!("Calling {method}");
        self.push(vec![Sample::now(
            metrics::MQTT_CALLS,
            self.method_tags(method, call_tags, pairs),
            1.0,
        )]);
    }

    /// Hooks for a new handle. They hold the client weakly and go quiet once
    /// `detach` is cancelled.
    pub(super) fn hooks(self: &Arc<Self>, detach: &CancellationToken) -> Hooks {
        let on_connect = (Arc::downgrade(self), detach.clone());
        let on_reconnect = (Arc::downgrade(self), detach.clone());
        let on_message = (Arc::downgrade(self), detach.clone());

        Hooks::default()
            .on_connect(move || {
                if let Some(inner) = live(&on_connect) {
                    debug!("Connected to MQTT broker");
                    inner.fire(EventKind::Connect, Vec::new());
                }
            })
            .on_reconnect(move || {
                if let Some(inner) = live(&on_reconnect) {
                    debug!("Reconnecting to MQTT broker");
                    inner.fire(EventKind::Reconnect, Vec::new());
                }
            })
            .on_message(move |message| {
                if let Some(inner) = live(&on_message) {
                    inner.message_received(message);
                }
            })
    }

    fn message_received(&self, message: Message) {
        debug!(topic = %message.topic, message_id = message.pkid, "Received MQTT message");

        let bytes = message.payload.len() as f64;
        let topic_tags = {
            let mut tags = self.tags();
            tags.insert("topic".into(), message.topic.clone());
            tags
        };
        self.push(vec![
            Sample::now(
                metrics::MQTT_CALLS,
                self.method_tags(
                    "message",
                    &TagSet::new(),
                    &[("topic", message.topic.as_str())],
                ),
                1.0,
            ),
            Sample::now(metrics::MQTT_MESSAGE_RECEIVED, topic_tags.clone(), 1.0),
            Sample::now(metrics::MQTT_DATA_RECEIVED, topic_tags, bytes),
            Sample::now(metrics::DATA_RECEIVED, self.host.current_tags(), bytes),
        ]);

        self.fire(
            EventKind::Message,
            vec![Value::from(message.topic), Value::Bytes(message.payload)],
        );
    }

    /// Cuts the old handle off from the registry, releases the dispatcher's
    /// hold on the host and disconnects.
    pub(super) async fn teardown(&self, old: Attached) {
        old.detach.cancel();
        self.dispatcher.detach();
        old.handle.disconnect().await;
    }

    /// Runs `execute` on the runtime and settles a promise with its outcome.
    pub(super) fn spawn_promise<F>(&self, execute: F) -> crate::runtime::Promise
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (promise, resolver) = crate::runtime::Promise::new(&*self.host);
        blocking::spawn(async move {
            resolver.settle(execute.await);
        });
        promise
    }
}

fn live(hook: &(Weak<Inner>, CancellationToken)) -> Option<Arc<Inner>> {
    let (inner, detach) = hook;
    if detach.is_cancelled() {
        return None;
    }
    inner.upgrade()
}
