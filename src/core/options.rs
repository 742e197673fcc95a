//! Normalization of script arguments into canonical option structs.
//!
//! Every parser here runs during Prepare: it either produces a fully
//! validated value or a Validation error, and never touches the network.
//! Missing options (`undefined`/`null`) take their defaults.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use loadmq_mqtt::{qos_from_u8, Credentials, QoS, ServerUrl, Will};

use super::{
    error::{Error, Result},
    metrics::TagSet,
};
use crate::runtime::{Function, Value};

fn string_field(value: &Value, key: &str) -> Result<Option<String>> {
    match value.get(key) {
        v if v.is_nullish() => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(Error::invalid_type(&format!("string for '{key}'"), other)),
    }
}

fn bool_field(value: &Value, key: &str) -> Result<bool> {
    match value.get(key) {
        v if v.is_nullish() => Ok(false),
        Value::Bool(b) => Ok(*b),
        other => Err(Error::invalid_type(&format!("boolean for '{key}'"), other)),
    }
}

fn qos_field(value: &Value, default: QoS) -> Result<QoS> {
    match value.get("qos") {
        v if v.is_nullish() => Ok(default),
        Value::Number(n) if n.fract() == 0.0 && (0.0..=2.0).contains(n) => {
            qos_from_u8(*n as u8).ok_or_else(|| Error::InvalidArgument(format!("qos {n}")))
        }
        Value::Number(n) => Err(Error::InvalidArgument(format!(
            "qos must be 0, 1 or 2, got {n}"
        ))),
        other => Err(Error::invalid_type("number for 'qos'", other)),
    }
}

fn tags_field(value: &Value) -> Result<TagSet> {
    match value.get("tags") {
        v if v.is_nullish() => Ok(TagSet::new()),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k.clone(), s.clone())),
                other => Err(Error::invalid_type(&format!("string for tag '{k}'"), other)),
            })
            .collect(),
        other => Err(Error::invalid_type("object for 'tags'", other)),
    }
}

fn expect_options(value: &Value) -> Result<()> {
    match value {
        Value::Undefined | Value::Null | Value::Object(_) => Ok(()),
        other => Err(Error::invalid_type("object", other)),
    }
}

fn topic_name(value: &Value) -> Result<String> {
    match value {
        Value::String(s) if s.is_empty() => Err(Error::InvalidArgument("empty topic".into())),
        Value::String(s) => Ok(s.clone()),
        other => Err(Error::invalid_type("string topic", other)),
    }
}

/// Text is sent as UTF-8, an `ArrayBuffer` as is.
pub(crate) fn payload(value: &Value) -> Result<Bytes> {
    match value {
        Value::String(s) => Ok(Bytes::from(s.clone())),
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(Error::invalid_type("String or ArrayBuffer", other)),
    }
}

/// Identity options given to the client constructor.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub client_id: String,
    pub credentials: Option<Credentials>,
    /// Called with no arguments on every connect; returns `{username, password}`.
    pub credentials_provider: Option<Function>,
    pub will: Option<Will>,
    pub tags: TagSet,
}

impl ClientOptions {
    pub fn parse(value: &Value) -> Result<Self> {
        expect_options(value)?;

        let username = string_field(value, "username")?;
        let password = string_field(value, "password")?;
        let credentials = match (username, password) {
            (None, None) => None,
            (username, password) => Some(Credentials {
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
            }),
        };

        let credentials_provider = match value.get("credentialsProvider") {
            v if v.is_nullish() => None,
            Value::Function(f) => Some(f.clone()),
            other => return Err(Error::invalid_type("function for 'credentialsProvider'", other)),
        };

        let will = match value.get("will") {
            v if v.is_nullish() => None,
            will @ Value::Object(_) => Some(Will {
                topic: string_field(will, "topic")?
                    .ok_or_else(|| Error::InvalidArgument("will requires a topic".into()))?,
                payload: match will.get("payload") {
                    v if v.is_nullish() => Bytes::new(),
                    v => payload(v)?,
                },
                qos: qos_field(will, QoS::AtMostOnce)?,
                retain: bool_field(will, "retain")?,
            }),
            other => return Err(Error::invalid_type("object for 'will'", other)),
        };

        Ok(Self {
            client_id: string_field(value, "clientId")?.unwrap_or_default(),
            credentials,
            credentials_provider,
            will,
            tags: tags_field(value)?,
        })
    }

    /// Credentials for the next CONNECT: the provider's answer if one is set,
    /// otherwise the static username/password.
    pub(crate) fn resolve_credentials(&self) -> Result<Option<Credentials>> {
        let Some(provider) = &self.credentials_provider else {
            return Ok(self.credentials.clone());
        };

        let creds = provider
            .call(&[])
            .map_err(|e| Error::Credentials(e.message))?;
        match &creds {
            Value::Object(_) => Ok(Some(Credentials {
                username: string_field(&creds, "username")
                    .map_err(|e| Error::Credentials(e.to_string()))?
                    .unwrap_or_default(),
                password: string_field(&creds, "password")
                    .map_err(|e| Error::Credentials(e.to_string()))?
                    .unwrap_or_default(),
            })),
            other => Err(Error::Credentials(format!(
                "object expected, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Options of `connect`, remembered for `reconnect`.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Only set when `keepalive` was a number.
    pub keepalive: Option<Duration>,
    /// Only set when `connectTimeout` was a non-negative number.
    pub connect_timeout: Option<Duration>,
    pub clean_session: bool,
    pub servers: Vec<String>,
    pub tags: TagSet,
}

impl ConnectOptions {
    pub fn parse(value: &Value) -> Result<Self> {
        if value.is_nullish() {
            return Ok(Self::default());
        }
        expect_options(value)?;

        let keepalive = value
            .get("keepalive")
            .as_f64()
            .map(|secs| Duration::from_secs(secs.max(0.0) as u64));
        let connect_timeout = value
            .get("connectTimeout")
            .as_f64()
            .filter(|ms| *ms >= 0.0)
            .map(|ms| Duration::from_millis(ms as u64));

        let servers = match value.get("servers") {
            v if v.is_nullish() => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(Error::invalid_type("string server address", other)),
                })
                .collect::<Result<_>>()?,
            other => return Err(Error::invalid_type("array for 'servers'", other)),
        };

        Ok(Self {
            keepalive,
            connect_timeout,
            clean_session: bool_field(value, "cleanSession")?,
            servers,
            tags: tags_field(value)?,
        })
    }
}

/// Normalized arguments of `connect(urlOrOptions, options?)`.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// The address given as first argument, if any.
    pub url: Option<String>,
    pub options: ConnectOptions,
    /// `url` followed by `options.servers`, parsed.
    pub servers: Vec<ServerUrl>,
}

impl ConnectTarget {
    pub fn parse(url_or_options: &Value, options: &Value) -> Result<Self> {
        let (url, options) = match url_or_options {
            Value::String(url) => (Some(url.clone()), ConnectOptions::parse(options)?),
            opts @ Value::Object(_) => (None, ConnectOptions::parse(opts)?),
            other => return Err(Error::invalid_type("string or object", other)),
        };

        let servers = url
            .iter()
            .chain(options.servers.iter())
            .map(|raw| {
                raw.parse::<ServerUrl>()
                    .map_err(|e| Error::InvalidArgument(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            return Err(Error::InvalidArgument("no server address given".into()));
        }

        Ok(Self {
            url,
            options,
            servers,
        })
    }

    /// Address reported in error tags: the explicit URL, else the first server.
    pub fn url_tag(&self) -> &str {
        self.url
            .as_deref()
            .or_else(|| self.servers.first().map(ServerUrl::as_str))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    pub tags: TagSet,
}

impl PublishOptions {
    pub fn parse(value: &Value) -> Result<Self> {
        expect_options(value)?;
        Ok(Self {
            qos: qos_field(value, QoS::AtMostOnce)?,
            retain: bool_field(value, "retain")?,
            tags: tags_field(value)?,
        })
    }
}

/// A topic argument: one topic, a list sharing one qos, or a map of
/// topic to per-topic options.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicSpec {
    Single(String),
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl TopicSpec {
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::String(_) => Ok(TopicSpec::Single(topic_name(value)?)),
            Value::Array(items) if items.is_empty() => {
                Err(Error::InvalidArgument("empty topic list".into()))
            }
            Value::Array(items) => Ok(TopicSpec::List(
                items.iter().map(topic_name).collect::<Result<_>>()?,
            )),
            Value::Object(map) if map.is_empty() => {
                Err(Error::InvalidArgument("empty topic map".into()))
            }
            Value::Object(map) => Ok(TopicSpec::Map(map.clone())),
            other => Err(Error::invalid_type(
                "String or Array of String or Object",
                other,
            )),
        }
    }

    /// Unique topics with their qos. `qos` applies to the single and list
    /// forms; map entries carry their own, defaulting to qos 0.
    pub fn subscriptions(&self, qos: QoS) -> Result<Vec<(String, QoS)>> {
        let mut out: Vec<(String, QoS)> = Vec::new();
        let mut push = |topic: String, qos: QoS| match out.iter_mut().find(|(t, _)| *t == topic) {
            Some(entry) => entry.1 = qos,
            None => out.push((topic, qos)),
        };

        match self {
            TopicSpec::Single(topic) => push(topic.clone(), qos),
            TopicSpec::List(topics) => topics.iter().for_each(|t| push(t.clone(), qos)),
            TopicSpec::Map(map) => {
                for (topic, options) in map {
                    if topic.is_empty() {
                        return Err(Error::InvalidArgument("empty topic".into()));
                    }
                    expect_options(options)?;
                    push(topic.clone(), qos_field(options, QoS::AtMostOnce)?);
                }
            }
        }
        Ok(out)
    }

    /// Unique topics for `unsubscribe`, which accepts no map.
    pub fn topics(&self) -> Result<Vec<String>> {
        let topics = match self {
            TopicSpec::Single(topic) => vec![topic.clone()],
            TopicSpec::List(topics) => {
                let mut unique: Vec<String> = Vec::with_capacity(topics.len());
                for topic in topics {
                    if !unique.contains(topic) {
                        unique.push(topic.clone());
                    }
                }
                unique
            }
            TopicSpec::Map(_) => {
                return Err(Error::InvalidType(
                    "String or Array of String expected, got object".into(),
                ))
            }
        };
        Ok(topics)
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub qos: QoS,
    pub tags: TagSet,
}

impl SubscribeOptions {
    pub fn parse(value: &Value) -> Result<Self> {
        expect_options(value)?;
        Ok(Self {
            qos: qos_field(value, QoS::AtMostOnce)?,
            tags: tags_field(value)?,
        })
    }
}

/// Options of `unsubscribe` and `end`: per-call tags only.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub tags: TagSet,
}

impl CallOptions {
    pub fn parse(value: &Value) -> Result<Self> {
        expect_options(value)?;
        Ok(Self {
            tags: tags_field(value)?,
        })
    }
}
