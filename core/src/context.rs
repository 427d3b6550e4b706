use tracing::warn;

use queue_api::Message;

use crate::{
    hub::{Hub, Viewer},
    ingest::IngestOptions,
    publish::{self, PublishError, Published},
    registry::Registry,
    store::{Snapshot, Store},
};

/// Everything the pull loops and the HTTP layer share: the message store,
/// the viewer hub and the topic registry.
pub struct Context {
    store: Store,
    hub: Hub,
    registry: Registry,
    ingest: IngestOptions,
}

impl Context {
    pub fn new(registry: Registry, max_messages: usize, hub: Hub, ingest: IngestOptions) -> Self {
        Self {
            store: Store::new(max_messages, registry.keys().cloned()),
            hub,
            registry,
            ingest,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ingest_options(&self) -> IngestOptions {
        self.ingest
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    /// Store a received message and push the new state to every viewer.
    pub fn record(&self, key: &str, message: Message) {
        self.store.append(key, message);
        // store lock is released before the hub lock is taken
        let snapshot = self.store.snapshot();
        if let Err(err) = self.hub.push(&snapshot) {
            warn!(topic = %key, error = %err, "could not serialize snapshot");
        }
    }

    /// Register a live viewer, seeded with the current snapshot.
    pub fn watch(&self) -> serde_json::Result<Viewer> {
        loop {
            // store lock is released before the hub lock is taken
            let snapshot = self.store.snapshot();
            if let Some(viewer) = self.hub.subscribe_with(&snapshot)? {
                return Ok(viewer);
            }
        }
    }

    pub async fn publish(&self, key: &str, payload: &[u8]) -> Result<Published, PublishError> {
        publish::publish(&self.registry, key, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backends::MemoryBroker, config::TopicConfig};

    async fn context() -> Context {
        let broker = MemoryBroker::new();
        let topics = [TopicConfig::new("p", "a"), TopicConfig::new("p", "b")];
        let registry = Registry::resolve(&topics, &broker).await.unwrap();
        Context::new(registry, 2, Hub::new(4), IngestOptions::default())
    }

    #[tokio::test]
    async fn store_is_seeded_with_registered_topics() {
        let ctx = context().await;
        let snap = ctx.snapshot();
        assert_eq!(snap.topics().keys().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(ctx.store().max_messages(), 2);
    }

    #[tokio::test]
    async fn watcher_starts_from_current_state() {
        let ctx = context().await;
        ctx.record("a", Message::new("1", "x"));
        let mut viewer = ctx.watch().unwrap();
        let first: serde_json::Value =
            serde_json::from_slice(&viewer.recv().await.unwrap()).unwrap();
        assert_eq!(first["a"][0]["id"], "1");
        ctx.record("b", Message::new("2", "y"));
        let next: serde_json::Value =
            serde_json::from_slice(&viewer.recv().await.unwrap()).unwrap();
        assert_eq!(next["b"][0]["id"], "2");
        assert_eq!(next["a"][0]["id"], "1");
    }

    #[tokio::test]
    async fn watchers_registered_during_records_end_on_latest_state() {
        use futures::FutureExt;
        use std::sync::Arc;

        let broker = MemoryBroker::new();
        let registry = Registry::resolve(&[TopicConfig::new("p", "a")], &broker)
            .await
            .unwrap();
        let ctx = Arc::new(Context::new(
            registry,
            5,
            Hub::new(1024),
            IngestOptions::default(),
        ));
        let writer = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    ctx.record("a", Message::new(i.to_string(), "x"));
                }
            })
        };
        let mut viewers = Vec::new();
        while !writer.is_finished() && viewers.len() < 200 {
            viewers.push(ctx.watch().unwrap());
        }
        writer.join().unwrap();

        let latest = ctx.snapshot().to_json().unwrap();
        for mut viewer in viewers {
            let mut last = None;
            while let Some(Some(payload)) = viewer.recv().now_or_never() {
                last = Some(payload);
            }
            assert_eq!(last.unwrap().as_ref(), latest.as_slice());
        }
    }
}
