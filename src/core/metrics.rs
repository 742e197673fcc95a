//! Samples and the sinks that receive them.
//!
//! The binding emits counters only. Every sample carries a [`TagSet`]
//! assembled by the client in a fixed order, later keys overriding earlier
//! ones:
//!
//! 1. the host's current tags
//! 2. `proto`, `client_id`, `url`
//! 3. client tags, then connect tags
//! 4. `method`
//! 5. per-call tags, then call-site pairs such as `topic`
//!
//! The builtin `data_sent` / `data_received` samples carry host tags only.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::debug;

/// Tag keys sorted by name; inserting an existing key overrides it.
pub type TagSet = BTreeMap<String, String>;

pub const MQTT_CALLS: &str = "mqtt_calls";
pub const MQTT_ERRORS: &str = "mqtt_errors";
pub const MQTT_MESSAGE_SENT: &str = "mqtt_message_sent";
pub const MQTT_MESSAGE_RECEIVED: &str = "mqtt_message_received";
pub const MQTT_DATA_SENT: &str = "mqtt_data_sent";
pub const MQTT_DATA_RECEIVED: &str = "mqtt_data_received";
pub const DATA_SENT: &str = "data_sent";
pub const DATA_RECEIVED: &str = "data_received";

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub metric: &'static str,
    pub tags: TagSet,
    pub time: OffsetDateTime,
    pub value: f64,
}

impl Sample {
    pub fn now(metric: &'static str, tags: TagSet, value: f64) -> Self {
        Self {
            metric,
            tags,
            time: OffsetDateTime::now_utc(),
            value,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Receives samples from every client of a module.
pub trait MetricsSink: Send + Sync {
    fn push(&self, samples: Vec<Sample>);
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Samples of one metric, in push order.
    pub fn by_metric(&self, metric: &str) -> Vec<Sample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.metric == metric)
            .cloned()
            .collect()
    }

    /// Sum of the values of one metric.
    pub fn total(&self, metric: &str) -> f64 {
        self.by_metric(metric).iter().map(|s| s.value).sum()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

impl MetricsSink for MemorySink {
    fn push(&self, samples: Vec<Sample>) {
        self.samples.lock().extend(samples);
    }
}

/// Logs every sample at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn push(&self, samples: Vec<Sample>) {
        for sample in samples {
            debug!(metric = sample.metric, value = sample.value, tags = ?sample.tags, "sample");
        }
    }
}

/// Extends `tags` with `extra`, later keys winning.
pub(crate) fn merge(mut tags: TagSet, extra: &TagSet) -> TagSet {
    tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    tags
}
