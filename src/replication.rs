//! Cross-node verdict replication.
//!
//! Every freshly computed verdict is published as a [`ReplicationMessage`].
//! Each node runs a [`ReplicationListener`] that applies messages from other
//! nodes to its own store. Delivery is at-least-once and unordered; the
//! store's `apply_replicated` makes replays and stale messages no-ops.

use crate::cache::VerdictCache;
use crate::config::{MessagingEngine, MessagingEngineConfig};
use crate::error::MessagingError;
use crate::store::SharedStore;
use crate::verdict::Verdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A verdict computed on one node, as sent to the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    /// `node.server_id` of the publishing node.
    pub origin: String,
    pub ip: String,
    pub verdict: Verdict,
    /// Unix milliseconds at which the origin computed the verdict.
    pub created: i64,
}

impl ReplicationMessage {
    pub fn encode(&self) -> Result<String, MessagingError> {
        serde_json::to_string(self).map_err(|e| MessagingError::Encode(e.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, MessagingError> {
        let message: Self =
            serde_json::from_str(payload).map_err(|e| MessagingError::Decode(e.to_string()))?;
        if let Verdict::Consensus(ratio) = message.verdict {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(MessagingError::Decode(format!(
                    "consensus {} is outside [0, 1]",
                    ratio
                )));
            }
        }
        Ok(message)
    }
}

/// Publish/subscribe transport for replication messages.
#[async_trait]
pub trait ReplicationBus: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Send a message to every subscriber, including ones on this node.
    async fn publish(&self, message: &ReplicationMessage) -> Result<(), MessagingError>;

    /// Start receiving messages published from now on.
    fn subscribe(&self) -> Result<Subscription, MessagingError>;

    /// Stop accepting messages. Subscriptions drain and then end.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Shared handle to a bus.
pub type SharedBus = Arc<dyn ReplicationBus>;

/// Receiving end of a bus subscription.
pub struct Subscription {
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<String>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once the bus is closed.
    ///
    /// Payloads that fail to decode are returned as errors so the caller
    /// can log them and keep going.
    pub async fn recv(&mut self) -> Option<Result<ReplicationMessage, MessagingError>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(ReplicationMessage::decode(&payload)),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(lagged = count, "Replication subscriber lagged, messages dropped");
                    continue;
                }
            }
        }
    }
}

/// In-process bus over a tokio broadcast channel.
///
/// Nodes sharing one `InMemoryBus` behave like a cluster on one broker.
pub struct InMemoryBus {
    name: String,
    sender: Mutex<Option<broadcast::Sender<String>>>,
    published: AtomicU64,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_name("memory", capacity)
    }

    pub fn with_name(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            published: AtomicU64::new(0),
        }
    }

    /// Send an already encoded payload.
    pub fn publish_raw(&self, payload: String) -> Result<(), MessagingError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| MessagingError::Send("bus lock poisoned".to_string()))?;
        let sender = sender.as_ref().ok_or(MessagingError::Closed)?;

        // No subscribers is not a failure; there is simply nobody to tell
        if sender.send(payload).is_err() {
            debug!(bus = %self.name, "Published with no subscribers");
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total messages accepted for delivery.
    pub fn messages_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplicationBus for InMemoryBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: &ReplicationMessage) -> Result<(), MessagingError> {
        self.publish_raw(message.encode()?)
    }

    fn subscribe(&self) -> Result<Subscription, MessagingError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| MessagingError::Send("bus lock poisoned".to_string()))?;
        let sender = sender.as_ref().ok_or(MessagingError::Closed)?;
        Ok(Subscription::new(sender.subscribe()))
    }

    async fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            if sender.take().is_some() {
                info!(bus = %self.name, "Replication bus closed");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }
}

/// Open the bus described by an engine config.
pub fn open(name: &str, config: &MessagingEngineConfig) -> SharedBus {
    match config.engine {
        MessagingEngine::Memory { capacity } => Arc::new(InMemoryBus::with_name(name, capacity)),
    }
}

/// Inbound side: applies messages from other nodes to the local store.
pub struct ReplicationListener {
    server_id: String,
    store: SharedStore,
    cache: Arc<VerdictCache>,
    max_age_millis: i64,
}

impl ReplicationListener {
    pub fn new(
        server_id: impl Into<String>,
        store: SharedStore,
        cache: Arc<VerdictCache>,
        max_age_millis: i64,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            store,
            cache,
            max_age_millis,
        }
    }

    /// Apply one message. Returns whether the store changed.
    pub async fn handle(&self, message: &ReplicationMessage) -> bool {
        if message.origin == self.server_id {
            return false;
        }

        match self
            .store
            .apply_replicated(&message.origin, &message.ip, message.verdict, message.created)
            .await
        {
            Ok(true) => {
                debug!(
                    ip = %message.ip,
                    origin = %message.origin,
                    verdict = ?message.verdict,
                    "Applied replicated verdict"
                );
                match self.store.get_by_ip(&message.ip, self.max_age_millis).await {
                    Ok(Some(record)) => self.cache.refresh(record),
                    Ok(None) => {}
                    Err(e) => warn!(ip = %message.ip, error = %e, "Failed to reload replicated verdict"),
                }
                true
            }
            Ok(false) => {
                debug!(ip = %message.ip, origin = %message.origin, "Replicated verdict already known");
                false
            }
            Err(e) => {
                warn!(
                    ip = %message.ip,
                    origin = %message.origin,
                    error = %e,
                    "Failed to apply replicated verdict"
                );
                false
            }
        }
    }

    /// Consume `subscription` on its own task until the bus closes.
    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(server_id = %self.server_id, "Replication listener started");
            while let Some(received) = subscription.recv().await {
                match received {
                    Ok(message) => {
                        self.handle(&message).await;
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed replication message"),
                }
            }
            info!(server_id = %self.server_id, "Replication listener stopped");
        })
    }
}
