use std::{collections::HashMap, sync::Arc};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::protocol::UserRecord;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    storage::KeyValueStore,
    transport::{endpoints, ApiRequest, HttpApi},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSlot {
    Full,
    Minified,
}

impl SessionSlot {
    pub fn storage_key(self) -> &'static str {
        match self {
            Self::Full => "user",
            Self::Minified => "user_min",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("offline")]
    Offline,
    #[error("unknown")]
    Unknown,
}

pub type SessionOutcome = Result<UserRecord, SessionError>;

#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub slot: SessionSlot,
    pub outcome: SessionOutcome,
}

type PendingSession = Shared<BoxFuture<'static, SessionOutcome>>;

struct SessionShared {
    api: Arc<dyn HttpApi>,
    storage: Arc<dyn KeyValueStore>,
    use_cache: bool,
    pending: Mutex<HashMap<SessionSlot, PendingSession>>,
    updates: broadcast::Sender<SessionUpdate>,
}

/// Resolves the signed-in user, coalescing concurrent lookups per slot.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<SessionShared>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn HttpApi>, storage: Arc<dyn KeyValueStore>, use_cache: bool) -> Self {
        let (updates, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(SessionShared {
                api,
                storage,
                use_cache,
                pending: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    pub async fn current_user(&self, slot: SessionSlot) -> SessionOutcome {
        let lookup = {
            let mut pending = self.shared.pending.lock().await;
            match pending.get(&slot) {
                Some(existing) => {
                    debug!(slot = slot.storage_key(), "session: already fetching user, joining");
                    existing.clone()
                }
                None => {
                    let lookup = fetch_current_user(Arc::clone(&self.shared), slot)
                        .boxed()
                        .shared();
                    pending.insert(slot, lookup.clone());
                    lookup
                }
            }
        };
        lookup.await
    }

    /// Receives every later lookup outcome and local update.
    pub fn watch_user(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub async fn update(&self, slot: SessionSlot, user: UserRecord) {
        if self.shared.use_cache {
            store_user(self.shared.storage.as_ref(), slot, &user).await;
        }
        let _ = self.shared.updates.send(SessionUpdate {
            slot,
            outcome: Ok(user),
        });
    }

    pub async fn clear(&self) {
        for slot in [SessionSlot::Full, SessionSlot::Minified] {
            self.shared.storage.delete(slot.storage_key()).await;
        }
    }
}

async fn fetch_current_user(shared: Arc<SessionShared>, slot: SessionSlot) -> SessionOutcome {
    let storage = shared.storage.as_ref();
    if !shared.use_cache {
        storage.delete(slot.storage_key()).await;
    }

    let outcome = match shared.api.request(ApiRequest::get(endpoints::CURRENT_USER)).await {
        Ok(response) if response.status == 200 => match response.json::<UserRecord>() {
            Ok(user) => {
                if shared.use_cache {
                    store_user(storage, slot, &user).await;
                }
                Ok(user)
            }
            Err(err) => {
                error!("session: unreadable user payload: {err}");
                Err(SessionError::Unknown)
            }
        },
        Ok(response) if response.status == 401 => {
            storage.delete(slot.storage_key()).await;
            Err(SessionError::Unauthorized)
        }
        Ok(response) if response.status == 503 => match cached_user(&shared, slot).await {
            Some(user) => {
                info!("session: server offline, serving cached user");
                Ok(user)
            }
            None => Err(SessionError::Offline),
        },
        Ok(response) => {
            error!(status = response.status, "session: unknown failure fetching user");
            Err(SessionError::Unknown)
        }
        Err(err) => {
            error!("session: failed to fetch user: {err}");
            Err(SessionError::Unknown)
        }
    };

    shared.pending.lock().await.remove(&slot);
    let _ = shared.updates.send(SessionUpdate {
        slot,
        outcome: outcome.clone(),
    });
    outcome
}

async fn cached_user(shared: &SessionShared, slot: SessionSlot) -> Option<UserRecord> {
    if !shared.use_cache {
        return None;
    }
    let value = shared.storage.get(slot.storage_key()).await?;
    match serde_json::from_value(value) {
        Ok(user) => Some(user),
        Err(err) => {
            warn!("session: skipping unreadable cached user: {err}");
            None
        }
    }
}

async fn store_user(storage: &dyn KeyValueStore, slot: SessionSlot, user: &UserRecord) {
    match serde_json::to_value(user) {
        Ok(value) => {
            storage.set(slot.storage_key(), value).await;
        }
        Err(err) => warn!("session: failed to serialize user: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
