use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use queue_api::{QueueClient, QueueError};
use tracing::info;

use crate::{
    backends::ClientFactory,
    config::{ExamplePayload, TopicConfig},
    store::TopicKey,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connecting to project '{project}': {source}")]
    Connect {
        project: String,
        #[source]
        source: QueueError,
    },
    #[error("checking topic '{topic}': {source}")]
    TopicCheck {
        topic: TopicKey,
        #[source]
        source: QueueError,
    },
    #[error("creating topic '{topic}': {source}")]
    TopicCreate {
        topic: TopicKey,
        #[source]
        source: QueueError,
    },
    #[error("checking subscription '{subscription}': {source}")]
    SubscriptionCheck {
        subscription: String,
        #[source]
        source: QueueError,
    },
    #[error("creating subscription '{subscription}': {source}")]
    SubscriptionCreate {
        subscription: String,
        #[source]
        source: QueueError,
    },
    #[error("topic '{0}' registered twice")]
    DuplicateKey(TopicKey),
}

/// A configured topic bound to its subscription and queue client.
pub struct TopicBinding {
    pub key: TopicKey,
    pub project: String,
    pub topic: String,
    pub subscription: String,
    pub client: Arc<dyn QueueClient>,
    pub payloads: Vec<ExamplePayload>,
}

/// Every topic the process tails, fixed after start-up.
pub struct Registry {
    bindings: BTreeMap<TopicKey, TopicBinding>,
}

impl Registry {
    /// Make sure every configured topic and subscription exists, creating
    /// the missing ones. Any failure aborts start-up.
    pub async fn resolve(
        topics: &[TopicConfig],
        factory: &dyn ClientFactory,
    ) -> Result<Self, RegistryError> {
        let mut clients: HashMap<String, Arc<dyn QueueClient>> = HashMap::new();
        let mut bindings = BTreeMap::new();
        for topic in topics {
            let key = topic.key();
            if bindings.contains_key(&key) {
                return Err(RegistryError::DuplicateKey(key));
            }
            let client = match clients.get(&topic.project) {
                Some(client) => client.clone(),
                None => {
                    let client =
                        factory
                            .connect(&topic.project)
                            .map_err(|source| RegistryError::Connect {
                                project: topic.project.clone(),
                                source,
                            })?;
                    clients.insert(topic.project.clone(), client.clone());
                    client
                }
            };

            let exists = client
                .topic_exists(&topic.name)
                .await
                .map_err(|source| RegistryError::TopicCheck {
                    topic: key.clone(),
                    source,
                })?;
            if !exists {
                info!(topic = %key, "topic doesn't exist - creating it");
                client
                    .create_topic(&topic.name)
                    .await
                    .map_err(|source| RegistryError::TopicCreate {
                        topic: key.clone(),
                        source,
                    })?;
            }

            let subscription = topic.subscription_name();
            if topic.subscription.is_none() {
                info!(topic = %key, subscription = %subscription, "no subscription name given, using default");
            }
            let exists = client
                .subscription_exists(&subscription)
                .await
                .map_err(|source| RegistryError::SubscriptionCheck {
                    subscription: subscription.clone(),
                    source,
                })?;
            if !exists {
                info!(topic = %key, subscription = %subscription, "subscription doesn't exist - creating it");
                client
                    .create_subscription(&subscription, &topic.name)
                    .await
                    .map_err(|source| RegistryError::SubscriptionCreate {
                        subscription: subscription.clone(),
                        source,
                    })?;
            }

            bindings.insert(
                key.clone(),
                TopicBinding {
                    key,
                    project: topic.project.clone(),
                    topic: topic.name.clone(),
                    subscription,
                    client,
                    payloads: topic.payloads.clone(),
                },
            );
        }
        Ok(Self { bindings })
    }

    pub fn get(&self, key: &str) -> Option<&TopicBinding> {
        self.bindings.get(key)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &TopicBinding> {
        self.bindings.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TopicKey> {
        self.bindings.keys()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
