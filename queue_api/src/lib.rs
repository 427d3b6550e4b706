use std::{borrow::Cow, collections::BTreeMap};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A message as delivered by a subscription. Immutable once received.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server assigned identifier.
    pub id: String,
    #[serde(with = "base64_data")]
    pub data: Bytes,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Publish time reported by the queue.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Message {
    pub fn new(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            attributes: BTreeMap::new(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn data_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// A message handed out by `pull` together with the id used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: Message,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("subscription '{0}' not found")]
    SubscriptionNotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("queue returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Operations the viewer needs from a managed message queue. A client is bound
/// to a single project; topic and subscription names are short ids within it.
#[async_trait]
pub trait QueueClient: Send + Sync {
    fn project(&self) -> &str;

    async fn topic_exists(&self, topic: &str) -> Result<bool, QueueError>;

    async fn create_topic(&self, topic: &str) -> Result<(), QueueError>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, QueueError>;

    async fn create_subscription(&self, subscription: &str, topic: &str)
        -> Result<(), QueueError>;

    /// Wait for the next batch of at most `max_messages` messages.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), QueueError>;

    /// Publish a message and wait for the id the queue assigns to it.
    async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, QueueError>;
}

/// Fully qualified topic resource name.
pub fn topic_path(project: &str, topic: &str) -> String {
    format!("projects/{project}/topics/{topic}")
}

/// Fully qualified subscription resource name.
pub fn subscription_path(project: &str, subscription: &str) -> String {
    format!("projects/{project}/subscriptions/{subscription}")
}

mod base64_data {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
