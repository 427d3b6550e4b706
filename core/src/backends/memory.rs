//! In-process broker with Pub/Sub style semantics: a subscription receives
//! every message published to its topic after the subscription was created,
//! ids are assigned from a counter, and `pull` waits until something arrives.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use queue_api::{
    subscription_path, topic_path, Message, QueueClient, QueueError, ReceivedMessage,
};
use tokio::sync::Notify;
use uuid::Uuid;

use super::ClientFactory;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Arc<SubscriptionQueue>>>,
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
}

struct SubscriptionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Message>,
    outstanding: HashMap<String, Message>,
    detached: bool,
}

/// Project-scoped view of a [`MemoryBroker`].
pub struct MemoryClient {
    broker: MemoryBroker,
    project: String,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Broker whose first published message gets id `first`.
    pub fn with_first_id(first: u64) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                next_id: AtomicU64::new(first),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    pub fn client(&self, project: &str) -> MemoryClient {
        MemoryClient {
            broker: self.clone(),
            project: project.to_string(),
        }
    }

    /// Delete a subscription. Pending and future pulls on it fail.
    pub fn detach_subscription(&self, project: &str, subscription: &str) -> bool {
        let path = subscription_path(project, subscription);
        let mut state = self.inner.state.lock();
        let Some(queue) = state.subscriptions.remove(&path) else {
            return false;
        };
        for subs in state.topics.values_mut() {
            subs.retain(|q| !Arc::ptr_eq(q, &queue));
        }
        queue.state.lock().detached = true;
        queue.notify.notify_waiters();
        true
    }

    /// Delete a topic. Its subscriptions stay but receive nothing further.
    pub fn delete_topic(&self, project: &str, topic: &str) -> bool {
        self.inner
            .state
            .lock()
            .topics
            .remove(&topic_path(project, topic))
            .is_some()
    }

    /// Delivered but not yet acknowledged messages on a subscription.
    pub fn outstanding(&self, project: &str, subscription: &str) -> Option<usize> {
        self.queue(&subscription_path(project, subscription))
            .map(|q| q.state.lock().outstanding.len())
    }

    fn queue(&self, path: &str) -> Option<Arc<SubscriptionQueue>> {
        self.inner.state.lock().subscriptions.get(path).cloned()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for MemoryBroker {
    fn connect(&self, project: &str) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(Arc::new(self.client(project)))
    }
}

#[async_trait]
impl QueueClient for MemoryClient {
    fn project(&self) -> &str {
        &self.project
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, QueueError> {
        let path = topic_path(&self.project, topic);
        Ok(self.broker.inner.state.lock().topics.contains_key(&path))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), QueueError> {
        let path = topic_path(&self.project, topic);
        let mut state = self.broker.inner.state.lock();
        if state.topics.contains_key(&path) {
            return Err(QueueError::AlreadyExists(path));
        }
        state.topics.insert(path, Vec::new());
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, QueueError> {
        let path = subscription_path(&self.project, subscription);
        Ok(self.broker.queue(&path).is_some())
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
    ) -> Result<(), QueueError> {
        let path = subscription_path(&self.project, subscription);
        let topic = topic_path(&self.project, topic);
        let mut state = self.broker.inner.state.lock();
        if state.subscriptions.contains_key(&path) {
            return Err(QueueError::AlreadyExists(path));
        }
        let queue = Arc::new(SubscriptionQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        state
            .topics
            .get_mut(&topic)
            .ok_or(QueueError::TopicNotFound(topic))?
            .push(queue.clone());
        state.subscriptions.insert(path, queue);
        Ok(())
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let path = subscription_path(&self.project, subscription);
        let queue = self
            .broker
            .queue(&path)
            .ok_or_else(|| QueueError::SubscriptionNotFound(path.clone()))?;
        loop {
            let notified = queue.notify.notified();
            {
                let mut state = queue.state.lock();
                if state.detached {
                    return Err(QueueError::SubscriptionNotFound(path));
                }
                if !state.pending.is_empty() {
                    let n = max_messages.max(1).min(state.pending.len());
                    let batch: Vec<Message> = state.pending.drain(..n).collect();
                    let received = batch
                        .into_iter()
                        .map(|message| {
                            let ack_id = Uuid::new_v4().to_string();
                            state.outstanding.insert(ack_id.clone(), message.clone());
                            ReceivedMessage { ack_id, message }
                        })
                        .collect();
                    return Ok(received);
                }
            }
            notified.await;
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), QueueError> {
        let path = subscription_path(&self.project, subscription);
        let queue = self
            .broker
            .queue(&path)
            .ok_or(QueueError::SubscriptionNotFound(path))?;
        let mut state = queue.state.lock();
        for id in ack_ids {
            state.outstanding.remove(id);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        data: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> Result<String, QueueError> {
        let path = topic_path(&self.project, topic);
        let state = self.broker.inner.state.lock();
        let subs = state
            .topics
            .get(&path)
            .ok_or(QueueError::TopicNotFound(path.clone()))?;
        let id = self
            .broker
            .inner
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let mut message = Message::new(id.clone(), data);
        message.attributes = attributes;
        for queue in subs {
            queue.state.lock().pending.push_back(message.clone());
            queue.notify.notify_waiters();
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn setup(broker: &MemoryBroker) -> MemoryClient {
        let client = broker.client("p");
        client.create_topic("orders").await.unwrap();
        client.create_subscription("sub-orders", "orders").await.unwrap();
        client
    }

    #[tokio::test]
    async fn publish_then_pull_and_ack() {
        let broker = MemoryBroker::new();
        let client = setup(&broker).await;
        let id = client
            .publish("orders", Bytes::from_static(b"hello"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(id, "1");
        let batch = client.pull("sub-orders", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message.data.as_ref(), b"hello");
        assert_eq!(broker.outstanding("p", "sub-orders"), Some(1));
        client
            .acknowledge("sub-orders", &[batch[0].ack_id.clone()])
            .await
            .unwrap();
        assert_eq!(broker.outstanding("p", "sub-orders"), Some(0));
    }

    #[tokio::test]
    async fn pull_waits_for_publish() {
        let broker = MemoryBroker::with_first_id(42);
        let client = Arc::new(setup(&broker).await);
        let puller = {
            let client = client.clone();
            tokio::spawn(async move { client.pull("sub-orders", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!puller.is_finished());
        client
            .publish("orders", Bytes::from_static(b"x"), BTreeMap::new())
            .await
            .unwrap();
        let batch = puller.await.unwrap().unwrap();
        assert_eq!(batch[0].message.id, "42");
    }

    #[tokio::test]
    async fn pull_respects_batch_size() {
        let broker = MemoryBroker::new();
        let client = setup(&broker).await;
        for _ in 0..3 {
            client
                .publish("orders", Bytes::from_static(b"x"), BTreeMap::new())
                .await
                .unwrap();
        }
        assert_eq!(client.pull("sub-orders", 2).await.unwrap().len(), 2);
        assert_eq!(client.pull("sub-orders", 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_creation_is_rejected() {
        let broker = MemoryBroker::new();
        let client = setup(&broker).await;
        assert!(matches!(
            client.create_topic("orders").await,
            Err(QueueError::AlreadyExists(_))
        ));
        assert!(matches!(
            client.create_subscription("sub-orders", "orders").await,
            Err(QueueError::AlreadyExists(_))
        ));
        assert!(matches!(
            client.create_subscription("other", "missing").await,
            Err(QueueError::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn projects_are_separate_namespaces() {
        let broker = MemoryBroker::new();
        setup(&broker).await;
        let other = broker.client("q");
        assert!(!other.topic_exists("orders").await.unwrap());
        assert!(other
            .publish("orders", Bytes::new(), BTreeMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn detaching_fails_a_waiting_pull() {
        let broker = MemoryBroker::new();
        let client = Arc::new(setup(&broker).await);
        let puller = {
            let client = client.clone();
            tokio::spawn(async move { client.pull("sub-orders", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.detach_subscription("p", "sub-orders"));
        assert!(matches!(
            puller.await.unwrap(),
            Err(QueueError::SubscriptionNotFound(_))
        ));
        // publishing to the topic still works
        client
            .publish("orders", Bytes::new(), BTreeMap::new())
            .await
            .unwrap();
    }
}
