use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Header RabbitMQ quorum queues use to report prior delivery attempts.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A value in an AMQP field table (headers, declaration arguments).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub headers: FieldTable,
    /// Delivery mode 2 when set.
    #[serde(default)]
    pub persistent: bool,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageProperties {
    pub(crate) fn timestamp_from_secs(secs: u64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs as i64, 0).single()
    }
}

/// A message on its way to the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    /// Creates a message with a generated message id and the current timestamp.
    pub fn new<B: Into<Vec<u8>>>(body: B) -> Self {
        OutgoingMessage {
            body: body.into(),
            properties: MessageProperties {
                message_id: Some(Uuid::new_v4().to_string()),
                timestamp: Some(Utc::now()),
                ..MessageProperties::default()
            },
        }
    }

    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.properties.message_id = Some(message_id.to_string());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.properties.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.properties.reply_to = Some(reply_to.to_string());
        self
    }

    pub fn with_header<V: Into<FieldValue>>(mut self, key: &str, value: V) -> Self {
        self.properties.headers.insert(key.to_string(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    pub fn with_expiration(mut self, expiration_ms: u64) -> Self {
        self.properties.expiration = Some(expiration_ms.to_string());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.properties.persistent = true;
        self
    }
}

impl From<Vec<u8>> for OutgoingMessage {
    fn from(body: Vec<u8>) -> Self {
        OutgoingMessage::new(body)
    }
}

impl From<&[u8]> for OutgoingMessage {
    fn from(body: &[u8]) -> Self {
        OutgoingMessage::new(body.to_vec())
    }
}

impl From<&str> for OutgoingMessage {
    fn from(body: &str) -> Self {
        OutgoingMessage::new(body.as_bytes().to_vec()).with_content_type("text/plain")
    }
}

impl From<String> for OutgoingMessage {
    fn from(body: String) -> Self {
        OutgoingMessage::new(body.into_bytes()).with_content_type("text/plain")
    }
}

/// A message handed to a consumer by the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Delivery {
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Prior delivery attempts as reported by the broker, if it reports them.
    pub fn delivery_count(&self) -> Option<u32> {
        match self.properties.headers.get(DELIVERY_COUNT_HEADER) {
            Some(FieldValue::Int(count)) => u32::try_from(*count).ok(),
            Some(FieldValue::Str(count)) => count.parse().ok(),
            _ => None,
        }
    }

    /// Stable identity used to count redeliveries of the same message.
    pub fn redelivery_key(&self) -> String {
        match &self.properties.message_id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = DefaultHasher::new();
                self.exchange.hash(&mut hasher);
                self.routing_key.hash(&mut hasher);
                self.body.hash(&mut hasher);
                format!("digest-{:016x}", hasher.finish())
            }
        }
    }
}
