//! Client defaults, the `[client]` section.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Defaults for every client created by a module.
///
/// Script-supplied connect options override `keepalive_secs` and
/// `connect_timeout_ms` per connection.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity of the channel between network callbacks and the dispatcher.
    #[validate(range(
        min = 1,
        max = 65536,
        message = "task_queue_capacity must be between 1 and 65536"
    ))]
    pub task_queue_capacity: usize,

    /// Keep-alive used when connect options carry none. Zero disables it.
    pub keepalive_secs: u64,

    /// Upper bound for one connect call, including every candidate server.
    #[validate(range(min = 1, message = "connect_timeout_ms must be at least 1"))]
    pub connect_timeout_ms: u64,

    /// Value of the `proto` metric tag.
    #[validate(length(min = 1))]
    pub protocol_tag: String,
}

impl ClientConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: 64,
            keepalive_secs: 60,
            connect_timeout_ms: 30_000,
            protocol_tag: "MQTT/3.1.1".to_string(),
        }
    }
}
