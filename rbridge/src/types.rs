use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::utils::{timestamp_millis, TimestampMillis};

pub type TopicName = ByteString;
pub type TopicFilter = ByteString;

/// Store-assigned, strictly increasing write sequence number
pub type Seq = u64;
pub type SubscriptionId = u64;

pub type HashMap<K, V> = std::collections::HashMap<K, V>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Coap,
    Http,
    Mqtt,
}

impl Protocol {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Coap => "coap",
            Protocol::Http => "http",
            Protocol::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last value written to a topic.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retain {
    pub topic: TopicName,
    pub payload: Bytes,
    pub retain: bool,
    /// Assigned by the store on write, zero until then
    pub seq: Seq,
    pub create_time: TimestampMillis,
}

impl Retain {
    #[inline]
    pub fn new<T: Into<TopicName>>(topic: T, payload: Bytes) -> Self {
        Self { topic: topic.into(), payload, retain: true, seq: 0, create_time: timestamp_millis() }
    }
}

impl fmt::Debug for Retain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retain")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("seq", &self.seq)
            .field("create_time", &self.create_time)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub retain: bool,
    /// Sequence number of the retained record this publish mirrors
    pub seq: Option<Seq>,
    pub origin: Option<Protocol>,
}

/// A publish as delivered to broker subscribers.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: TopicName,
    pub payload: Bytes,
    pub retain: bool,
    pub seq: Option<Seq>,
    pub origin: Option<Protocol>,
}

impl Message {
    #[inline]
    pub fn new(topic: TopicName, payload: Bytes, opts: &PublishOptions) -> Self {
        Self { topic, payload, retain: opts.retain, seq: opts.seq, origin: opts.origin }
    }
}

impl From<Retain> for Message {
    fn from(r: Retain) -> Self {
        Self { topic: r.topic, payload: r.payload, retain: true, seq: Some(r.seq), origin: None }
    }
}

/// Fired once per successful retained write, whichever protocol carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateEvent {
    pub topic: TopicName,
    pub payload: Bytes,
    pub seq: Seq,
    pub origin: Protocol,
}

/// Authenticated principal, passed verbatim from authentication to authorization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subject(serde_json::Value);

impl Subject {
    #[inline]
    pub fn new(v: serde_json::Value) -> Self {
        Subject(v)
    }

    #[inline]
    pub fn anonymous() -> Self {
        Subject(serde_json::Value::Null)
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.0.is_null()
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    #[inline]
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}
