use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;

use super::*;
use crate::{
    storage::MemoryStore,
    tests_support::{ok_json, user_json, FakeApi},
    transport::ApiResponse,
};

fn manager(api: Arc<FakeApi>, storage: Arc<MemoryStore>, use_cache: bool) -> SessionManager {
    SessionManager::new(api, storage, use_cache)
}

#[tokio::test]
async fn concurrent_lookups_share_one_request() {
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(FakeApi::gated(Arc::clone(&gate), |_| {
        ok_json(user_json("u1", "ada"))
    }));
    let session = manager(Arc::clone(&api), Arc::new(MemoryStore::new()), false);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.current_user(SessionSlot::Full).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(api.request_count(), 1);

    gate.add_permits(1);
    for handle in handles {
        let user = handle.await.expect("join").expect("user");
        assert_eq!(user.username, "ada");
    }
    assert_eq!(api.request_count(), 1);
}

#[tokio::test]
async fn slots_are_fetched_independently() {
    let api = Arc::new(FakeApi::new(|_| ok_json(user_json("u1", "ada"))));
    let session = manager(Arc::clone(&api), Arc::new(MemoryStore::new()), false);

    session.current_user(SessionSlot::Full).await.expect("full");
    session.current_user(SessionSlot::Minified).await.expect("min");
    assert_eq!(api.request_count(), 2);
}

#[tokio::test]
async fn classifies_failure_statuses() {
    for (status, expected) in [
        (401, SessionError::Unauthorized),
        (503, SessionError::Offline),
        (500, SessionError::Unknown),
    ] {
        let api = Arc::new(FakeApi::new(move |_| ApiResponse::new(status, None)));
        let session = manager(api, Arc::new(MemoryStore::new()), false);
        assert_eq!(
            session.current_user(SessionSlot::Full).await,
            Err(expected.clone())
        );
    }
}

#[test]
fn session_errors_render_as_lowercase_reasons() {
    let reasons: Vec<String> = [
        SessionError::Unauthorized,
        SessionError::Offline,
        SessionError::Unknown,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    assert_eq!(reasons, ["unauthorized", "offline", "unknown"]);

    let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(SessionError::Offline);
    assert_eq!(boxed.to_string(), "offline");
}

#[tokio::test]
async fn unauthorized_drops_cached_user() {
    let storage = Arc::new(MemoryStore::new());
    storage.set("user", user_json("u1", "ada")).await;
    let api = Arc::new(FakeApi::new(|_| ApiResponse::new(401, None)));
    let session = manager(api, Arc::clone(&storage), true);

    assert_eq!(
        session.current_user(SessionSlot::Full).await,
        Err(SessionError::Unauthorized)
    );
    assert_eq!(storage.get("user").await, None);
}

#[tokio::test]
async fn offline_serves_cached_user_when_caching_enabled() {
    let storage = Arc::new(MemoryStore::new());
    storage.set("user", user_json("u1", "ada")).await;
    let api = Arc::new(FakeApi::new(|_| ApiResponse::unavailable()));
    let session = manager(api, Arc::clone(&storage), true);

    let user = session.current_user(SessionSlot::Full).await.expect("cached");
    assert_eq!(user.username, "ada");
}

#[tokio::test]
async fn disabled_cache_removes_stale_copy() {
    let storage = Arc::new(MemoryStore::new());
    storage.set("user_min", json!({ "stale": true })).await;
    let api = Arc::new(FakeApi::new(|_| ApiResponse::unavailable()));
    let session = manager(api, Arc::clone(&storage), false);

    assert_eq!(
        session.current_user(SessionSlot::Minified).await,
        Err(SessionError::Offline)
    );
    assert_eq!(storage.get("user_min").await, None);
}

#[tokio::test]
async fn listeners_observe_lookups_and_updates() {
    let api = Arc::new(FakeApi::new(|_| ok_json(user_json("u1", "ada"))));
    let storage = Arc::new(MemoryStore::new());
    let session = manager(api, Arc::clone(&storage), true);
    let mut updates = session.watch_user();

    session.current_user(SessionSlot::Full).await.expect("user");
    let first = updates.recv().await.expect("update");
    assert_eq!(first.slot, SessionSlot::Full);
    assert_eq!(first.outcome.expect("ok").username, "ada");

    let mut renamed: UserRecord =
        serde_json::from_value(user_json("u1", "ada")).expect("record");
    renamed.username = "ada.l".into();
    session.update(SessionSlot::Full, renamed).await;
    let second = updates.recv().await.expect("update");
    assert_eq!(second.outcome.expect("ok").username, "ada.l");
    assert_eq!(storage.get("user").await.expect("stored")["username"], "ada.l");

    session.clear().await;
    assert_eq!(storage.get("user").await, None);
}
