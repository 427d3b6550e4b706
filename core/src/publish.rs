use std::collections::BTreeMap;

use bytes::Bytes;
use queue_api::QueueError;
use serde::Serialize;

use crate::{registry::Registry, store::TopicKey};

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub id: String,
    pub topic: TopicKey,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("could not publish message: {0}")]
    Queue(#[from] QueueError),
}

/// Publish `payload`, trimmed of surrounding whitespace, to a registered
/// topic and wait for the id the queue assigns.
pub async fn publish(
    registry: &Registry,
    key: &str,
    payload: &[u8],
) -> Result<Published, PublishError> {
    let binding = registry
        .get(key)
        .ok_or_else(|| PublishError::UnknownTopic(key.to_string()))?;
    let data = Bytes::copy_from_slice(trim(payload));
    let id = binding
        .client
        .publish(&binding.topic, data, BTreeMap::new())
        .await?;
    Ok(Published {
        id,
        topic: binding.key.clone(),
    })
}

fn trim(payload: &[u8]) -> &[u8] {
    match std::str::from_utf8(payload) {
        Ok(text) => text.trim().as_bytes(),
        Err(_) => payload.trim_ascii(),
    }
}
