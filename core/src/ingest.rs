use std::sync::Arc;

use queue_api::{QueueError, ReceivedMessage};
use serde::Deserialize;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

use crate::{context::Context, registry::TopicBinding, store::TopicKey};

/// Default number of messages requested per pull.
pub const DEFAULT_PULL_BATCH: usize = 10;

/// When a received batch is acknowledged relative to storing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// Ack first. A crash before the store update loses the messages from
    /// the live view but never shows them twice.
    #[default]
    BeforeStore,
    /// Store and broadcast first. A crash before the ack gets the messages
    /// redelivered and shown again.
    AfterStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub pull_batch: usize,
    pub ack: AckPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            pull_batch: DEFAULT_PULL_BATCH,
            ack: AckPolicy::default(),
        }
    }
}

/// Runs one pull loop per registered topic until cancelled.
pub struct Ingestor {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Ingestor {
    pub fn start(ctx: Arc<Context>, cancel: CancellationToken) -> Self {
        let tracker = TaskTracker::new();
        for key in ctx.registry().keys() {
            tracker.spawn(pull_loop(ctx.clone(), key.clone(), cancel.clone()));
        }
        tracker.close();
        Self { tracker, cancel }
    }

    /// Number of pull loops still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every loop to end on its own.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Cancel every loop and wait for them to return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

async fn pull_loop(ctx: Arc<Context>, key: TopicKey, cancel: CancellationToken) {
    let Some(binding) = ctx.registry().get(&key) else {
        return;
    };
    let options = ctx.ingest_options();
    info!(topic = %key, subscription = %binding.subscription, "pull loop started");
    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = binding.client.pull(&binding.subscription, options.pull_batch) => res,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                error!(topic = %key, subscription = %binding.subscription, error = %err, "receive failed - stopping pull loop");
                return;
            }
        };
        // leave an unprocessed batch unacknowledged for redelivery
        if cancel.is_cancelled() {
            break;
        }
        if batch.is_empty() {
            continue;
        }
        if let Err(err) = deliver(&ctx, binding, batch, options.ack).await {
            error!(topic = %key, subscription = %binding.subscription, error = %err, "acknowledge failed - stopping pull loop");
            return;
        }
    }
    info!(topic = %key, subscription = %binding.subscription, "pull loop stopped");
}

async fn deliver(
    ctx: &Context,
    binding: &TopicBinding,
    batch: Vec<ReceivedMessage>,
    ack: AckPolicy,
) -> Result<(), QueueError> {
    let ack_ids: Vec<String> = batch.iter().map(|r| r.ack_id.clone()).collect();
    if ack == AckPolicy::BeforeStore {
        binding
            .client
            .acknowledge(&binding.subscription, &ack_ids)
            .await?;
    }
    for received in batch {
        let message = received.message;
        info!(
            topic = %binding.key,
            subscription = %binding.subscription,
            id = %message.id,
            "got message: {:?}",
            message.data_lossy()
        );
        ctx.record(&binding.key, message);
    }
    if ack == AckPolicy::AfterStore {
        binding
            .client
            .acknowledge(&binding.subscription, &ack_ids)
            .await?;
    }
    Ok(())
}
