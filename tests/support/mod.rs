//! Shared fixtures for the integration tests.
#![allow(dead_code)]

pub mod broker;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use loadmq::{
    config::Config,
    mqtt::{
        Connector, HandleOptions, Hooks, Message, NetworkError, NetworkHandle, QoS, Result, Token,
    },
    runtime::{Function, ScriptError, Value},
    EventLoop, MemorySink, Module,
};
use parking_lot::Mutex;

/// Records every request and answers from a script of failures instead of a broker.
#[derive(Default)]
pub struct MockState {
    calls: Mutex<Vec<String>>,
    opened: Mutex<Vec<HandleOptions>>,
    hooks: Mutex<Option<Hooks>>,
    failing_topics: Mutex<HashSet<String>>,
    subscriptions: Mutex<HashSet<String>>,
    requested_qos: Mutex<Vec<(String, QoS)>>,
    refuse_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockState {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls whose description starts with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Topic and qos of every subscribe request, in issue order.
    pub fn requested_qos(&self) -> Vec<(String, QoS)> {
        self.requested_qos.lock().clone()
    }

    pub fn opened(&self) -> Vec<HandleOptions> {
        self.opened.lock().clone()
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().insert(topic.to_string());
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Delivers a message through the hooks of the most recent handle.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let hooks = self.hooks.lock().clone();
        if let Some(hooks) = hooks {
            hooks.message(message(topic, Bytes::copy_from_slice(payload)));
        }
    }

    /// Simulates the driver losing and re-establishing its session.
    pub fn drop_and_restore(&self) {
        let hooks = self.hooks.lock().clone();
        if let Some(hooks) = hooks {
            hooks.reconnecting();
            hooks.connected();
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn failing(&self, topic: &str) -> bool {
        self.failing_topics.lock().contains(topic)
    }
}

fn message(topic: &str, payload: Bytes) -> Message {
    Message {
        topic: topic.to_string(),
        payload,
        qos: QoS::AtMostOnce,
        retain: false,
        pkid: 0,
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub state: Arc<MockState>,
}

impl Connector for MockConnector {
    fn open(&self, options: HandleOptions, hooks: Hooks) -> Result<Arc<dyn NetworkHandle>> {
        if options.servers.is_empty() {
            return Err(NetworkError::NoServers);
        }
        let client_id = if options.client_id.is_empty() {
            "mock-client".to_string()
        } else {
            options.client_id.clone()
        };
        let url = options.servers[0].to_string();

        self.state.opened.lock().push(options);
        *self.state.hooks.lock() = Some(hooks.clone());
        self.state.record("open".into());

        Ok(Arc::new(MockHandle {
            state: self.state.clone(),
            hooks,
            client_id,
            url,
            connected: AtomicBool::new(false),
        }))
    }
}

struct MockHandle {
    state: Arc<MockState>,
    hooks: Hooks,
    client_id: String,
    url: String,
    connected: AtomicBool,
}

#[async_trait]
impl NetworkHandle for MockHandle {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn server_url(&self) -> &str {
        &self.url
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Token {
        self.state.record("connect".into());
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Token::ready(Err(NetworkError::ConnectionClosed));
        }

        self.connected.store(true, Ordering::SeqCst);
        self.hooks.connected();
        Token::ready(Ok(()))
    }

    async fn disconnect(&self) {
        self.state.record("disconnect".into());
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, topic: &str, _qos: QoS, _retain: bool, payload: Bytes) -> Token {
        self.state.record(format!("publish {topic}"));
        if self.state.failing(topic) {
            return Token::ready(Err(NetworkError::ConnectionLost));
        }
        if self.state.subscriptions.lock().contains(topic) {
            self.hooks.message(message(topic, payload));
        }
        Token::ready(Ok(()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Token {
        self.state.record(format!("subscribe {topic}"));
        self.state.requested_qos.lock().push((topic.to_string(), qos));
        if self.state.failing(topic) {
            return Token::ready(Err(NetworkError::SubscribeRejected {
                topic: topic.to_string(),
            }));
        }
        self.state.subscriptions.lock().insert(topic.to_string());
        Token::ready(Ok(()))
    }

    async fn unsubscribe(&self, topic: &str) -> Token {
        self.state.record(format!("unsubscribe {topic}"));
        if self.state.failing(topic) {
            return Token::ready(Err(NetworkError::ConnectionLost));
        }
        self.state.subscriptions.lock().remove(topic);
        Token::ready(Ok(()))
    }
}

/// A module wired to a mock connector, an event loop and an in-memory sink.
pub struct Fixture {
    pub event_loop: EventLoop,
    pub sink: Arc<MemorySink>,
    pub mock: Arc<MockState>,
    pub module: Module,
}

impl Fixture {
    pub fn new() -> Self {
        let event_loop = EventLoop::new();
        event_loop.set_tag("scenario", "default");
        let sink = Arc::new(MemorySink::new());
        let connector = MockConnector::default();
        let mock = connector.state.clone();
        let module = Module::with_connector(
            Arc::new(event_loop.clone()),
            sink.clone(),
            Config::default(),
            Arc::new(connector),
        );

        Self {
            event_loop,
            sink,
            mock,
            module,
        }
    }
}

/// Shorthand for building values from JSON literals.
pub fn v(json: serde_json::Value) -> Value {
    json.into()
}

/// A handler that appends its first string argument (or the event name) to `log`.
pub fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Function {
    let log = log.clone();
    let label = label.to_string();
    Function::from_fn(move |args: &[Value]| {
        let entry = match args.first().and_then(Value::as_str) {
            Some(arg) => format!("{label}:{arg}"),
            None => label.clone(),
        };
        log.lock().push(entry);
        Ok(())
    })
}

/// A handler that fails the iteration with `message`.
pub fn thrower(message: &'static str) -> Function {
    Function::from_fn(move |_| Err(ScriptError::new(message)))
}
