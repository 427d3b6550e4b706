//! Client for the Pub/Sub v1 REST protocol as served by the Pub/Sub emulator.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use queue_api::{
    subscription_path, topic_path, Message, QueueClient, QueueError, ReceivedMessage,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::ClientFactory;

/// Default emulator address used by `gcloud beta emulators pubsub start`.
pub const DEFAULT_ENDPOINT: &str = "localhost:8085";

/// Builds one [`EmulatorClient`] per project, sharing a connection pool.
pub struct EmulatorFactory {
    http: reqwest::Client,
    endpoint: String,
}

pub struct EmulatorClient {
    http: reqwest::Client,
    endpoint: String,
    project: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
    return_immediately: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceived>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceived {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    message_id: String,
    publish_time: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Serialize)]
struct PublishRequest {
    messages: Vec<OutgoingMessage>,
}

#[derive(Serialize)]
struct OutgoingMessage {
    data: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

impl EmulatorFactory {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: normalize_endpoint(endpoint),
        }
    }
}

impl ClientFactory for EmulatorFactory {
    fn connect(&self, project: &str) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(Arc::new(EmulatorClient {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            project: project.to_string(),
        }))
    }
}

impl EmulatorClient {
    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.endpoint, resource)
    }

    async fn exists(&self, resource: &str) -> Result<bool, QueueError> {
        let resp = self
            .http
            .get(self.url(resource))
            .send()
            .await
            .map_err(transport)?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(status_error(resp).await),
        }
    }

    async fn create(&self, resource: String, body: serde_json::Value) -> Result<(), QueueError> {
        let resp = self
            .http
            .put(self.url(&resource))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        match resp.status() {
            StatusCode::CONFLICT => Err(QueueError::AlreadyExists(resource)),
            s if s.is_success() => Ok(()),
            _ => Err(status_error(resp).await),
        }
    }

    async fn post<B: Serialize>(&self, url: String, body: &B) -> Result<reqwest::Response, QueueError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(status_error(resp).await)
        }
    }
}

#[async_trait]
impl QueueClient for EmulatorClient {
    fn project(&self) -> &str {
        &self.project
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, QueueError> {
        self.exists(&topic_path(&self.project, topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<(), QueueError> {
        self.create(topic_path(&self.project, topic), json!({})).await
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, QueueError> {
        self.exists(&subscription_path(&self.project, subscription))
            .await
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
    ) -> Result<(), QueueError> {
        self.create(
            subscription_path(&self.project, subscription),
            json!({ "topic": topic_path(&self.project, topic) }),
        )
        .await
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let url = format!(
            "{}:pull",
            self.url(&subscription_path(&self.project, subscription))
        );
        let body = PullRequest {
            max_messages: max_messages.max(1),
            return_immediately: false,
        };
        let resp: PullResponse = self
            .post(url, &body)
            .await?
            .json()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        resp.received_messages
            .into_iter()
            .map(|r| {
                Ok(ReceivedMessage {
                    ack_id: r.ack_id,
                    message: decode_message(r.message)?,
                })
            })
            .collect()
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), QueueError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}:acknowledge",
            self.url(&subscription_path(&self.project, subscription))
        );
        self.post(url, &AcknowledgeRequest { ack_ids }).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let url = format!("{}:publish", self.url(&topic_path(&self.project, topic)));
        let body = PublishRequest {
            messages: vec![OutgoingMessage {
                data: STANDARD.encode(&data),
                attributes,
            }],
        };
        let resp: PublishResponse = self
            .post(url, &body)
            .await?
            .json()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        resp.message_ids
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::Decode("publish response carried no message id".into()))
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn decode_message(wire: WireMessage) -> Result<Message, QueueError> {
    let data = STANDARD
        .decode(wire.data.as_bytes())
        .map_err(|e| QueueError::Decode(format!("message {}: {e}", wire.message_id)))?;
    let timestamp = match wire.publish_time.as_deref() {
        Some(t) => OffsetDateTime::parse(t, &Rfc3339)
            .map_err(|e| QueueError::Decode(format!("publish time {t:?}: {e}")))?,
        None => OffsetDateTime::now_utc(),
    };
    Ok(Message {
        id: wire.message_id,
        data: Bytes::from(data),
        attributes: wire.attributes,
        timestamp,
    })
}

fn transport(err: reqwest::Error) -> QueueError {
    QueueError::Transport(err.to_string())
}

async fn status_error(resp: reqwest::Response) -> QueueError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    QueueError::Status { status, body }
}
