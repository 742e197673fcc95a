//! `subscribe`, `unsubscribe` and their async variants.
//!
//! One request is issued per unique topic before any of them is awaited.
//! The waits then run in topic order and stop at the first failure: that
//! failure is what the call reports, and the remaining requests are left to
//! complete on their own without being observed.

use std::sync::Arc;

use loadmq_mqtt::QoS;
use tracing::debug;

use super::{
    blocking::run_blocking,
    client::{Client, Inner},
    error::{Error, Result},
    metrics::TagSet,
    options::{CallOptions, SubscribeOptions, TopicSpec},
};
use crate::runtime::{Promise, Value};

pub(super) struct SubscribeCall {
    topics: Vec<(String, QoS)>,
    tags: TagSet,
}

pub(super) struct UnsubscribeCall {
    topics: Vec<String>,
    tags: TagSet,
}

impl Client {
    /// Subscribes to a topic, a list of topics sharing `options.qos`, or a
    /// map of topic to `{qos}`. Map entries without a qos subscribe at qos 0.
    pub fn subscribe(&self, topics: impl Into<Value>, options: impl Into<Value>) -> Result<()> {
        let call = self
            .inner
            .prepare_subscribe(&topics.into(), &options.into())?;
        run_blocking(self.inner.clone().execute_subscribe(call))
    }

    pub fn subscribe_async(
        &self,
        topics: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<Promise> {
        let call = self
            .inner
            .prepare_subscribe(&topics.into(), &options.into())?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_subscribe(call)))
    }

    /// Unsubscribes from a topic or a list of topics.
    pub fn unsubscribe(&self, topics: impl Into<Value>, options: impl Into<Value>) -> Result<()> {
        let call = self
            .inner
            .prepare_unsubscribe(&topics.into(), &options.into())?;
        run_blocking(self.inner.clone().execute_unsubscribe(call))
    }

    pub fn unsubscribe_async(
        &self,
        topics: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<Promise> {
        let call = self
            .inner
            .prepare_unsubscribe(&topics.into(), &options.into())?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_unsubscribe(call)))
    }
}

impl Inner {
    fn prepare_subscribe(
        self: &Arc<Self>,
        topics: &Value,
        options: &Value,
    ) -> Result<SubscribeCall> {
        self.ensure_connected()?;
        let options = SubscribeOptions::parse(options)?;
        let topics = TopicSpec::parse(topics)?.subscriptions(options.qos)?;

        Ok(SubscribeCall {
            topics,
            tags: options.tags,
        })
    }

    async fn execute_subscribe(self: Arc<Self>, call: SubscribeCall) -> Result<()> {
        let slot = self.slot.read().await;
        let Some(attached) = slot.as_ref() else {
            return Err(Error::NotConnected);
        };

        debug!("Subscribing to MQTT topic(s)");
        let mut tokens = Vec::with_capacity(call.topics.len());
        for (topic, qos) in &call.topics {
            debug!(topic = %topic, qos = ?qos, "Subscribing to topic");
            tokens.push((topic, attached.handle.subscribe(topic, *qos).await));
        }

        for (topic, token) in tokens {
            if let Err(err) = token.wait().await {
                return self.handle_error(
                    err,
                    "subscribe",
                    &call.tags,
                    &[("topic", topic.as_str())],
                );
            }
            self.push_call("subscribe", &call.tags, &[("topic", topic.as_str())]);
        }
        Ok(())
    }

    fn prepare_unsubscribe(
        self: &Arc<Self>,
        topics: &Value,
        options: &Value,
    ) -> Result<UnsubscribeCall> {
        self.ensure_connected()?;
        let topics = TopicSpec::parse(topics)?.topics()?;
        let options = CallOptions::parse(options)?;

        Ok(UnsubscribeCall {
            topics,
            tags: options.tags,
        })
    }

    async fn execute_unsubscribe(self: Arc<Self>, call: UnsubscribeCall) -> Result<()> {
        let slot = self.slot.read().await;
        let Some(attached) = slot.as_ref() else {
            return Err(Error::NotConnected);
        };

        debug!("Unsubscribing from MQTT topic(s)");
        let mut tokens = Vec::with_capacity(call.topics.len());
        for topic in &call.topics {
            debug!(topic = %topic, "Unsubscribing from topic");
            tokens.push((topic, attached.handle.unsubscribe(topic).await));
        }

        for (topic, token) in tokens {
            if let Err(err) = token.wait().await {
                return self.handle_error(
                    err,
                    "unsubscribe",
                    &call.tags,
                    &[("topic", topic.as_str())],
                );
            }
            self.push_call("unsubscribe", &call.tags, &[("topic", topic.as_str())]);
        }
        Ok(())
    }
}
