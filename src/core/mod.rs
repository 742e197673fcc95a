//! The binding itself: clients, their operations and the machinery that
//! moves network events onto the script engine.
//!
//! * `client`: [`Module`] and [`Client`], the script-visible surface
//! * `lifecycle`, `publish`, `subscribe`: the operations, each split into a
//!   synchronous Prepare step and an Execute step on the shared runtime
//! * `dispatcher` and `task_queue`: ordered delivery of event handlers onto
//!   the host, holding the host open while a connection is attached
//! * `blocking`: the process-wide runtime and the sync bridge into it
//! * [`metrics`]: sample names, tags and sinks
//! * [`options`]: parsing of script-supplied option objects

mod blocking;
mod client;
mod dispatcher;
mod error;
mod events;
mod lifecycle;
pub mod metrics;
pub mod options;
mod publish;
mod state;
mod subscribe;
mod task_queue;

pub use self::{
    client::{Client, Module},
    error::{Error, ErrorKind, MqttError, Result, MQTT_ERROR_NAME},
    events::EventKind,
    metrics::{MemorySink, MetricsSink, Sample, TagSet, TracingSink},
    state::ConnectionState,
};
