//! Event kinds and the per-client handler table.

use std::{collections::HashMap, fmt, str::FromStr};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::runtime::Function;

/// The closed set of events a script can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Every successful CONNACK, including automatic reconnects.
    Connect,
    /// The driver is about to re-establish a lost connection.
    Reconnect,
    /// `end` was called.
    End,
    /// A network failure; receives an `MQTTError` object.
    Error,
    /// An application message; receives the topic and an `ArrayBuffer` payload.
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Connect,
        EventKind::Reconnect,
        EventKind::End,
        EventKind::Error,
        EventKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Reconnect => "reconnect",
            EventKind::End => "end",
            EventKind::Error => "error",
            EventKind::Message => "message",
        }
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// At most one handler per [`EventKind`]; the last registration wins.
#[derive(Debug, Default)]
pub(crate) struct EventRegistry {
    handlers: RwLock<HashMap<EventKind, Function>>,
}

impl EventRegistry {
    /// Binds `handler` to `event`. Unknown names are logged and ignored.
    pub(crate) fn register(&self, event: &str, handler: Function) {
        let Ok(kind) = event.parse::<EventKind>() else {
            warn!(event, "Unknown event type");
            return;
        };

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&kind) {
            warn!(event = %kind, "Event handler already registered, overriding");
        }
        debug!(event = %kind, "Event handler registered");
        handlers.insert(kind, handler);
    }

    pub(crate) fn get(&self, kind: EventKind) -> Option<Function> {
        self.handlers.read().get(&kind).cloned()
    }
}
