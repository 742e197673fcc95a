//! `publish` and `publishAsync`.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{
    blocking::run_blocking,
    client::{Client, Inner},
    error::{Error, Result},
    metrics::{self, Sample},
    options::{payload, PublishOptions},
};
use crate::runtime::{Promise, Value};

pub(super) struct PublishCall {
    topic: String,
    payload: Bytes,
    options: PublishOptions,
}

impl Client {
    /// Publishes `message` (text or `ArrayBuffer`) to `topic` and waits for
    /// the acknowledgement its qos requires.
    pub fn publish(
        &self,
        topic: &str,
        message: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<()> {
        let call = self
            .inner
            .prepare_publish(topic, &message.into(), &options.into())?;
        run_blocking(self.inner.clone().execute_publish(call))
    }

    pub fn publish_async(
        &self,
        topic: &str,
        message: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<Promise> {
        let call = self
            .inner
            .prepare_publish(topic, &message.into(), &options.into())?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_publish(call)))
    }
}

impl Inner {
    fn prepare_publish(
        self: &Arc<Self>,
        topic: &str,
        message: &Value,
        options: &Value,
    ) -> Result<PublishCall> {
        self.ensure_connected()?;
        if topic.is_empty() {
            return Err(Error::InvalidArgument("empty topic".into()));
        }

        Ok(PublishCall {
            topic: topic.to_string(),
            payload: payload(message)?,
            options: PublishOptions::parse(options)?,
        })
    }

    async fn execute_publish(self: Arc<Self>, call: PublishCall) -> Result<()> {
        let slot = self.slot.read().await;
        let Some(attached) = slot.as_ref() else {
            return Err(Error::NotConnected);
        };

        debug!(topic = %call.topic, qos = ?call.options.qos, "Publishing message to MQTT broker");
        let bytes = call.payload.len() as f64;
        let result = attached
            .handle
            .publish(
                &call.topic,
                call.options.qos,
                call.options.retain,
                call.payload,
            )
            .await
            .wait()
            .await;
        drop(slot);

        if let Err(err) = result {
            return self.handle_error(
                err,
                "publish",
                &call.options.tags,
                &[("topic", call.topic.as_str())],
            );
        }

        let mut topic_tags = self.tags();
        topic_tags.insert("topic".into(), call.topic.clone());
        self.push(vec![
            Sample::now(
                metrics::MQTT_CALLS,
                self.method_tags(
                    "publish",
                    &call.options.tags,
                    &[("topic", call.topic.as_str())],
                ),
                1.0,
            ),
            Sample::now(metrics::MQTT_MESSAGE_SENT, topic_tags.clone(), 1.0),
            Sample::now(metrics::MQTT_DATA_SENT, topic_tags, bytes),
            Sample::now(metrics::DATA_SENT, self.host.current_tags(), bytes),
        ]);
        Ok(())
    }
}
