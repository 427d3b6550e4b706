use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Snapshot;

/// Default number of undelivered snapshots a viewer may have queued.
pub const DEFAULT_VIEWER_BUFFER: usize = 16;

/// Fan-out point for live viewers. Every push is serialized once and the same
/// bytes are queued for each registered viewer.
///
/// Each viewer owns a bounded queue. A viewer whose queue is full is
/// disconnected rather than allowed to hold up the others; it is expected to
/// reconnect and start again from a fresh snapshot.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    buffer: usize,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    viewers: HashMap<Uuid, mpsc::Sender<Bytes>>,
    last_version: u64,
}

/// Receiving end of a viewer registration. Dropping it unsubscribes.
pub struct Viewer {
    id: Uuid,
    rx: mpsc::Receiver<Bytes>,
    hub: Hub,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer: buffer.max(1),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Register a viewer that receives every push from now on.
    pub fn subscribe(&self) -> Viewer {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = Uuid::new_v4();
        self.inner.state.lock().viewers.insert(id, tx);
        debug!(viewer = %id, "viewer registered");
        Viewer {
            id,
            rx,
            hub: self.clone(),
        }
    }

    /// Register a viewer whose first delivery is `initial`. Returns `None`
    /// without registering when a newer snapshot has already been pushed,
    /// since the viewer would never hear about the difference; the caller
    /// retries with a fresh snapshot.
    pub fn subscribe_with(&self, initial: &Snapshot) -> serde_json::Result<Option<Viewer>> {
        let payload = Bytes::from(initial.to_json()?);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = Uuid::new_v4();
        {
            let mut state = self.inner.state.lock();
            if initial.version() < state.last_version {
                debug!(
                    version = initial.version(),
                    latest = state.last_version,
                    "seed snapshot is stale"
                );
                return Ok(None);
            }
            state.last_version = initial.version();
            // fresh channel, cannot be full
            let _ = tx.try_send(payload);
            state.viewers.insert(id, tx);
        }
        debug!(viewer = %id, "viewer registered");
        Ok(Some(Viewer {
            id,
            rx,
            hub: self.clone(),
        }))
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.inner.state.lock().viewers.remove(&id).is_some() {
            debug!(viewer = %id, "viewer unregistered");
        }
    }

    /// Number of registered viewers.
    pub fn len(&self) -> usize {
        self.inner.state.lock().viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize `snapshot` and queue it for every viewer. Returns the number
    /// of viewers still registered afterwards.
    pub fn push(&self, snapshot: &Snapshot) -> serde_json::Result<usize> {
        let payload = Bytes::from(snapshot.to_json()?);
        let mut state = self.inner.state.lock();
        if snapshot.version() < state.last_version {
            debug!(
                version = snapshot.version(),
                latest = state.last_version,
                "skipping stale snapshot"
            );
            return Ok(state.viewers.len());
        }
        state.last_version = snapshot.version();
        state
            .viewers
            .retain(|id, tx| match tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(viewer = %id, "viewer is not keeping up - disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(viewer = %id, "viewer went away");
                    false
                }
            });
        Ok(state.viewers.len())
    }

    /// Drop every registration, ending all viewer streams.
    pub fn disconnect_all(&self) {
        self.inner.state.lock().viewers.clear();
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_BUFFER)
    }
}

impl Viewer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next serialized snapshot. `None` once the hub has dropped this viewer.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for Viewer {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
