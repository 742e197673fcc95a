//! loadmq: MQTT client binding for scripted load-test workloads
//!
//! A test script creates clients, connects them to a broker, publishes,
//! subscribes and reacts to events, while every call is recorded as a metric
//! sample tagged with the iteration that made it. The network side runs on a
//! shared tokio runtime; script callbacks only ever run on the host's own
//! event loop.
//!
//! ## Modules
//!
//! * `config`: TOML configuration for logging, client defaults and the
//!   network layer, validated with the `validator` crate. Missing files fall
//!   back to defaults.
//!
//! * `core`: The binding:
//!   - `Module` and `Client`, the script-visible surface
//!   - connect, reconnect, end, publish, subscribe and unsubscribe, each with
//!     a blocking and a promise-returning variant
//!   - event handlers (`connect`, `reconnect`, `message`, `end`, `error`)
//!     delivered in order through a per-client dispatcher
//!   - metric samples and sinks
//!
//! * `runtime`: The scripting-engine boundary (`Host`), plus a reference
//!   event loop, values, functions and promises.
//!
//! * `logger`: Logging initialization using `tracing`. Supports console
//!   output in compact, pretty and JSON formats.
//!
//! The network handles themselves live in the `loadmq-mqtt` crate, re-exported
//! here as [`mqtt`].

pub mod config;
pub mod core;
pub mod logger;
pub mod runtime;

pub use loadmq_mqtt as mqtt;

pub use crate::core::{
    Client, ConnectionState, Error, ErrorKind, EventKind, MemorySink, MetricsSink, Module,
    MqttError, Result, Sample, TagSet, TracingSink,
};
pub use crate::runtime::{EventLoop, Function, Host, Promise, PromiseState, ScriptError, Value};
