use std::{collections::HashMap, sync::Arc};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::{
    domain::UserId,
    protocol::{UserLookupResponse, UserRecord},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{ClientError, ClientResult},
    transport::{endpoints, with_query, ApiRequest, HttpApi},
};

type PendingLookup = Shared<BoxFuture<'static, Option<UserRecord>>>;

#[derive(Default)]
struct DirectoryState {
    users: HashMap<UserId, UserRecord>,
    pending: HashMap<UserId, PendingLookup>,
    /// Bumped by `clear` so lookups started earlier cannot repopulate the cache.
    generation: u64,
}

/// Memoizing user lookup with at most one outstanding request per user.
pub struct UserDirectory {
    api: Arc<dyn HttpApi>,
    state: Arc<Mutex<DirectoryState>>,
}

impl UserDirectory {
    pub fn new(api: Arc<dyn HttpApi>) -> Self {
        Self {
            api,
            state: Arc::new(Mutex::new(DirectoryState::default())),
        }
    }

    /// Cached entry, the result of an in-flight lookup, or a fresh lookup.
    /// Failures are not cached.
    pub async fn resolve(&self, user_id: &UserId) -> Option<UserRecord> {
        let lookup = {
            let mut state = self.state.lock().await;
            if let Some(user) = state.users.get(user_id) {
                return Some(user.clone());
            }
            match state.pending.get(user_id) {
                Some(pending) => {
                    debug!(%user_id, "users: joining in-flight lookup");
                    pending.clone()
                }
                None => {
                    let lookup = fetch_and_cache(
                        Arc::clone(&self.api),
                        Arc::clone(&self.state),
                        user_id.clone(),
                        state.generation,
                    )
                    .boxed()
                    .shared();
                    state.pending.insert(user_id.clone(), lookup.clone());
                    lookup
                }
            }
        };
        lookup.await
    }

    pub async fn cached(&self, user_id: &UserId) -> Option<UserRecord> {
        self.state.lock().await.users.get(user_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.users.clear();
        state.pending.clear();
        state.generation += 1;
    }
}

async fn fetch_and_cache(
    api: Arc<dyn HttpApi>,
    state: Arc<Mutex<DirectoryState>>,
    user_id: UserId,
    generation: u64,
) -> Option<UserRecord> {
    let result = lookup_user(api.as_ref(), &user_id).await;

    let mut guard = state.lock().await;
    if guard.generation == generation {
        guard.pending.remove(&user_id);
        if let Ok(user) = &result {
            guard.users.insert(user_id.clone(), user.clone());
        }
    }
    drop(guard);

    match result {
        Ok(user) => Some(user),
        Err(err) => {
            warn!(%user_id, "users: lookup failed: {err}");
            None
        }
    }
}

async fn lookup_user(api: &dyn HttpApi, user_id: &UserId) -> ClientResult<UserRecord> {
    let path = with_query(endpoints::PUBLIC_USER, &[("userId", user_id.as_str())]);
    let response = api.request(ApiRequest::get(path)).await?;
    if !response.is_success() {
        return Err(ClientError::from_status(
            response.status,
            &format!("Failed to fetch user with ID {user_id}"),
        ));
    }

    let body: UserLookupResponse = response.json()?;
    if !body.success {
        return Err(ClientError::server(
            response.status,
            body.message
                .unwrap_or_else(|| "Failed to fetch user data".to_string()),
        ));
    }
    body.user
        .ok_or_else(|| ClientError::Decode("user lookup response without user".into()))
}

#[cfg(test)]
#[path = "tests/user_directory_tests.rs"]
mod tests;
