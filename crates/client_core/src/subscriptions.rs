use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::StreamExt;
use shared::{domain::SubscriptionKey, protocol::StreamEvent};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    event_stream::EventStreamConnector,
    events::MessengerEvent,
    store::SharedStore,
    transport::{endpoints, with_query},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Connecting,
    Connected,
    Disconnected,
}

struct SubscriptionEntry {
    generation: u64,
    status: SubscriptionStatus,
    task: JoinHandle<()>,
}

struct SubscriptionShared {
    connector: Arc<dyn EventStreamConnector>,
    store: Arc<SharedStore>,
    reconnect_delay: Duration,
    /// Never held across an await, so `Drop` can always reach the tasks.
    registry: Mutex<HashMap<SubscriptionKey, SubscriptionEntry>>,
    next_generation: AtomicU64,
}

/// One push connection per [`SubscriptionKey`], reconnecting after
/// `reconnect_delay` until the key is unsubscribed.
pub struct SubscriptionManager {
    shared: Arc<SubscriptionShared>,
}

pub fn endpoint_for(key: &SubscriptionKey) -> String {
    match key {
        SubscriptionKey::AllChannels => endpoints::SUBSCRIBE_ALL.to_string(),
        SubscriptionKey::Channel(channel_id) => with_query(
            endpoints::SUBSCRIBE_CHANNEL,
            &[("channelId", channel_id.as_str())],
        ),
    }
}

impl SubscriptionManager {
    pub fn new(
        connector: Arc<dyn EventStreamConnector>,
        store: Arc<SharedStore>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(SubscriptionShared {
                connector,
                store,
                reconnect_delay,
                registry: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Starts a subscription; a key that is already registered is left as is.
    pub async fn subscribe(&self, key: SubscriptionKey) {
        let mut registry = self.shared.registry();
        if registry.contains_key(&key) {
            debug!(%key, "subscriptions: already subscribed");
            return;
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.shared),
            key.clone(),
            generation,
        ));
        registry.insert(
            key.clone(),
            SubscriptionEntry {
                generation,
                status: SubscriptionStatus::Connecting,
                task,
            },
        );
        self.shared.store.emit(MessengerEvent::SubscriptionStatusChanged {
            key: key.clone(),
            status: Some(SubscriptionStatus::Connecting),
        });
        drop(registry);
        info!(%key, "subscriptions: subscribed");
    }

    /// Closes the connection and cancels any pending reconnect. Once this
    /// returns the subscription can no longer write into the store.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = self.shared.registry().remove(key);
        let Some(entry) = removed else {
            return false;
        };
        entry.task.abort();
        let _ = entry.task.await;
        info!(%key, "subscriptions: unsubscribed");
        self.shared.store.emit(MessengerEvent::SubscriptionStatusChanged {
            key: key.clone(),
            status: None,
        });
        true
    }

    pub async fn unsubscribe_all(&self) {
        let drained: Vec<_> = self.shared.registry().drain().collect();
        for (key, entry) in drained {
            entry.task.abort();
            let _ = entry.task.await;
            self.shared.store.emit(MessengerEvent::SubscriptionStatusChanged {
                key,
                status: None,
            });
        }
    }

    pub async fn status(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        self.shared.registry().get(key).map(|entry| entry.status)
    }

    pub async fn is_connected(&self, key: &SubscriptionKey) -> bool {
        self.status(key).await == Some(SubscriptionStatus::Connected)
    }

    pub async fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.shared.registry().keys().cloned().collect()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (key, entry) in self.shared.registry().drain() {
            debug!(%key, "subscriptions: aborting on shutdown");
            entry.task.abort();
        }
    }
}

impl SubscriptionShared {
    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, SubscriptionEntry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a status for the live entry; `false` when the entry is gone.
    fn set_status(&self, key: &SubscriptionKey, generation: u64, status: SubscriptionStatus) -> bool {
        {
            let mut registry = self.registry();
            match registry.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    if entry.status == status {
                        return true;
                    }
                    entry.status = status;
                }
                _ => return false,
            }
        }
        self.store.emit(MessengerEvent::SubscriptionStatusChanged {
            key: key.clone(),
            status: Some(status),
        });
        true
    }

    fn is_registered(&self, key: &SubscriptionKey, generation: u64) -> bool {
        self.registry()
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }

    async fn dispatch(&self, key: &SubscriptionKey, payload: &str) {
        let event = match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%key, "subscriptions: dropping malformed event: {err}");
                return;
            }
        };

        match event {
            StreamEvent::Connected { .. } => debug!(%key, "subscriptions: stream confirmed"),
            StreamEvent::Heartbeat { .. } => debug!(%key, "subscriptions: heartbeat"),
            StreamEvent::Message { data, channel_id } => {
                if let SubscriptionKey::Channel(scope) = key {
                    if scope != &channel_id {
                        debug!(%key, %channel_id, "subscriptions: ignoring out-of-scope message");
                        return;
                    }
                }
                self.store.merge_message(&channel_id, data, false).await;
            }
        }
    }
}

async fn run_subscription(shared: Arc<SubscriptionShared>, key: SubscriptionKey, generation: u64) {
    let path = endpoint_for(&key);
    loop {
        match shared.connector.open(&path).await {
            Ok(mut events) => {
                if !shared.set_status(&key, generation, SubscriptionStatus::Connected) {
                    return;
                }
                info!(%key, "subscriptions: connected");

                let reason = loop {
                    match events.next().await {
                        Some(Ok(payload)) => shared.dispatch(&key, &payload).await,
                        Some(Err(err)) => break err.to_string(),
                        None => break "stream closed by server".to_string(),
                    }
                };
                warn!(%key, "subscriptions: connection lost: {reason}");
            }
            Err(err) => warn!(%key, "subscriptions: failed to connect: {err}"),
        }

        if !shared.set_status(&key, generation, SubscriptionStatus::Disconnected) {
            return;
        }
        tokio::time::sleep(shared.reconnect_delay).await;
        if !shared.is_registered(&key, generation) {
            debug!(%key, "subscriptions: reconnect skipped for removed subscription");
            return;
        }
        info!(%key, "subscriptions: reconnecting");
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
