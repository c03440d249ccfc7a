use std::time::Duration;

use serde_json::json;
use shared::domain::ChannelId;
use tokio::sync::broadcast;

use super::*;
use crate::tests_support::{wait_until, FakeConnector};

fn setup() -> (Arc<FakeConnector>, Arc<SharedStore>, SubscriptionManager) {
    let connector = Arc::new(FakeConnector::default());
    let (events, _) = broadcast::channel(64);
    let store = Arc::new(SharedStore::new(events));
    let manager = SubscriptionManager::new(
        connector.clone(),
        Arc::clone(&store),
        Duration::from_secs(5),
    );
    (connector, store, manager)
}

fn message_event(message_id: &str, channel_id: &str, content: &str) -> String {
    json!({
        "type": "message",
        "channelId": channel_id,
        "timestamp": "2024-03-01T12:00:00Z",
        "data": {
            "messageId": message_id,
            "channelId": channel_id,
            "senderUserId": "u2",
            "content": content,
            "createdAt": "2024-03-01T12:00:00Z",
            "updatedAt": "2024-03-01T12:00:00Z"
        }
    })
    .to_string()
}

async fn wait_for_status(
    manager: &SubscriptionManager,
    key: &SubscriptionKey,
    expected: Option<SubscriptionStatus>,
) {
    for _ in 0..500 {
        if manager.status(key).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("subscription {key} never reached {expected:?}");
}

async fn wait_for_messages(store: &SharedStore, channel_id: &ChannelId, count: usize) {
    for _ in 0..500 {
        if store.read().await.messages(channel_id).len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("channel {channel_id} never held {count} messages");
}

#[test]
fn endpoints_differ_per_scope() {
    assert_eq!(endpoint_for(&SubscriptionKey::AllChannels), "/api/message/subscribe");
    assert_eq!(
        endpoint_for(&SubscriptionKey::Channel(ChannelId::new("c 1"))),
        "/api/message/subscribe/channel?channelId=c+1"
    );
}

#[tokio::test(start_paused = true)]
async fn message_events_flow_into_store() {
    let (connector, store, manager) = setup();
    let key = SubscriptionKey::AllChannels;
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;

    connector.push(0, r#"{"type":"connected"}"#);
    connector.push(0, r#"{"type":"heartbeat"}"#);
    connector.push(0, message_event("m1", "c1", "hello"));
    wait_for_messages(&store, &ChannelId::new("c1"), 1).await;

    assert!(manager.is_connected(&key).await);
    assert_eq!(connector.opened_paths(), vec!["/api/message/subscribe".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn malformed_payloads_are_dropped_without_closing_stream() {
    let (connector, store, manager) = setup();
    let key = SubscriptionKey::AllChannels;
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;

    connector.push(0, "not json at all");
    connector.push(0, r#"{"type":"message","channelId":"c1"}"#);
    connector.push(0, r#"{"type":"typing"}"#);
    connector.push(0, message_event("m1", "c1", "still alive"));
    wait_for_messages(&store, &ChannelId::new("c1"), 1).await;

    assert!(manager.is_connected(&key).await);
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_reconnects_after_fixed_delay() {
    let (connector, _store, manager) = setup();
    let key = SubscriptionKey::AllChannels;
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;

    connector.fail(0);
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Disconnected)).await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(connector.open_count(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_until(|| connector.open_count() == 2).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;
}

#[tokio::test(start_paused = true)]
async fn refused_connection_keeps_retrying() {
    let (connector, _store, manager) = setup();
    connector.refuse_connections(true);
    let key = SubscriptionKey::Channel(ChannelId::new("c1"));
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Disconnected)).await;

    connector.refuse_connections(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_before_reconnect_cancels_retry() {
    let (connector, _store, manager) = setup();
    let key = SubscriptionKey::Channel(ChannelId::new("c1"));
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;

    connector.fail(0);
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Disconnected)).await;
    assert!(manager.unsubscribe(&key).await);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.open_count(), 1);
    assert_eq!(manager.status(&key).await, None);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_closes_live_connection() {
    let (connector, _store, manager) = setup();
    let key = SubscriptionKey::AllChannels;
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;

    assert!(manager.unsubscribe(&key).await);
    wait_until(|| connector.is_closed(0)).await;
    assert!(!manager.unsubscribe(&key).await);
}

#[tokio::test(start_paused = true)]
async fn both_scopes_feed_the_same_idempotent_merge() {
    let (connector, store, manager) = setup();
    let all = SubscriptionKey::AllChannels;
    let focused = SubscriptionKey::Channel(ChannelId::new("c1"));
    manager.subscribe(all.clone()).await;
    manager.subscribe(focused.clone()).await;
    wait_for_status(&manager, &all, Some(SubscriptionStatus::Connected)).await;
    wait_for_status(&manager, &focused, Some(SubscriptionStatus::Connected)).await;
    assert_eq!(connector.open_count(), 2);

    connector.push(0, message_event("m1", "c1", "once"));
    connector.push(1, message_event("m1", "c1", "once"));
    wait_for_messages(&store, &ChannelId::new("c1"), 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = store.read().await;
    assert_eq!(state.messages(&ChannelId::new("c1")).len(), 1);
    assert_eq!(state.messages(&ChannelId::new("c1"))[0].content, "once");
}

#[tokio::test(start_paused = true)]
async fn focused_scope_ignores_other_channels() {
    let (connector, store, manager) = setup();
    let focused = SubscriptionKey::Channel(ChannelId::new("c1"));
    manager.subscribe(focused.clone()).await;
    wait_for_status(&manager, &focused, Some(SubscriptionStatus::Connected)).await;

    connector.push(0, message_event("m7", "c2", "elsewhere"));
    connector.push(0, message_event("m8", "c1", "here"));
    wait_for_messages(&store, &ChannelId::new("c1"), 1).await;
    assert!(store.read().await.messages(&ChannelId::new("c2")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_subscribe_keeps_single_connection() {
    let (connector, _store, manager) = setup();
    let key = SubscriptionKey::AllChannels;
    manager.subscribe(key.clone()).await;
    manager.subscribe(key.clone()).await;
    wait_for_status(&manager, &key, Some(SubscriptionStatus::Connected)).await;
    assert_eq!(connector.open_count(), 1);
    assert_eq!(manager.active_keys().await, vec![key]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_all_tears_down_every_key() {
    let (connector, store, manager) = setup();
    let mut events = store.subscribe();
    manager.subscribe(SubscriptionKey::AllChannels).await;
    manager
        .subscribe(SubscriptionKey::Channel(ChannelId::new("c1")))
        .await;
    wait_until(|| connector.open_count() == 2).await;

    manager.unsubscribe_all().await;
    assert!(manager.active_keys().await.is_empty());
    wait_until(|| connector.is_closed(0) && connector.is_closed(1)).await;

    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            MessengerEvent::SubscriptionStatusChanged { status: None, .. }
        ) {
            closed += 1;
        }
    }
    assert_eq!(closed, 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_manager_stops_every_connection() {
    let (connector, store, manager) = setup();
    manager.subscribe(SubscriptionKey::AllChannels).await;
    manager
        .subscribe(SubscriptionKey::Channel(ChannelId::new("c1")))
        .await;
    wait_until(|| connector.open_count() == 2).await;
    connector.fail(1);

    drop(manager);
    wait_until(|| connector.is_closed(0)).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.open_count(), 2);
    assert_eq!(Arc::strong_count(&store), 1);
}
