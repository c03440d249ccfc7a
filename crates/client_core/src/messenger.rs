use std::{collections::HashSet, sync::Arc};

use futures::future::join_all;
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChannelId, SubscriptionKey, UserId},
    protocol::{
        ApiEnvelope, ChannelData, CreateChannelRequest, CreateChannelResponse, MessageData,
        SendMessageRequest, UserRecord,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    error::{ClientError, ClientResult, ValidationError},
    event_stream::{EventStreamConnector, SseConnector},
    events::MessengerEvent,
    session::SessionManager,
    storage::{JsonFileStore, KeyValueStore, MemoryStore},
    store::{MergeOutcome, SharedStore},
    subscriptions::{SubscriptionManager, SubscriptionStatus},
    transport::{self, endpoints, with_query, ApiClient, ApiRequest, ApiResponse, HttpApi},
    user_directory::UserDirectory,
};

const EVENT_CAPACITY: usize = 256;
const UNKNOWN_SENDER: &str = "Unknown Sender";

/// Public entry point of the engine: fetches, sends and subscribes, and
/// exposes the resulting channel and message state.
///
/// One `Messenger` corresponds to one signed-in session. [`Messenger::clear_state`]
/// (or [`Messenger::logout`]) is the teardown path.
pub struct Messenger {
    api: Arc<dyn HttpApi>,
    settings: ClientSettings,
    users: Arc<UserDirectory>,
    store: Arc<SharedStore>,
    subscriptions: SubscriptionManager,
    session: SessionManager,
}

impl Messenger {
    pub fn new(
        api: Arc<dyn HttpApi>,
        connector: Arc<dyn EventStreamConnector>,
        storage: Arc<dyn KeyValueStore>,
        settings: ClientSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Arc::new(SharedStore::new(events));
        let subscriptions =
            SubscriptionManager::new(connector, Arc::clone(&store), settings.reconnect_delay());
        let session = SessionManager::new(Arc::clone(&api), storage, settings.session_cache);

        Self {
            users: Arc::new(UserDirectory::new(Arc::clone(&api))),
            api,
            settings,
            store,
            subscriptions,
            session,
        }
    }

    /// Wires the engine to a live backend. HTTP calls and event streams share
    /// one cookie store.
    pub fn connect(settings: ClientSettings) -> ClientResult<Self> {
        let api = ApiClient::new(settings.backend_url.clone())?;
        let connector = SseConnector::new(api.http_client(), api.base_url());
        let storage: Arc<dyn KeyValueStore> = match &settings.session_cache_path {
            Some(path) if settings.session_cache => Arc::new(JsonFileStore::new(path.clone())),
            _ => Arc::new(MemoryStore::new()),
        };
        info!(backend = %api.base_url(), "messenger: connecting");
        Ok(Self::new(Arc::new(api), Arc::new(connector), storage, settings))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.store.subscribe()
    }

    pub async fn server_status(&self) -> transport::ServerStatus {
        transport::server_status(self.api.as_ref()).await
    }

    /// Replaces the channel list with the newest `limit` channels.
    pub async fn fetch_channels(&self, limit: Option<u32>) -> bool {
        let limit = limit.unwrap_or(self.settings.channel_page_size);
        self.store
            .update(|state| {
                state.set_loading_channels(true);
                state.set_channels_error(None);
            })
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);

        let limit = limit.to_string();
        let path = with_query(endpoints::CHANNELS, &[("limit", limit.as_str())]);
        let result = self
            .get_data::<Vec<ChannelData>>(path, "Failed to fetch channels")
            .await;

        let fetched = match result {
            Ok(channels) => {
                info!(count = channels.len(), "messenger: channels fetched");
                self.store
                    .update(|state| {
                        state.replace_channels(channels);
                        state.set_loading_channels(false);
                    })
                    .await;
                self.store.emit(MessengerEvent::ChannelsUpdated);
                true
            }
            Err(err) => {
                let message = err.to_string();
                error!("messenger: error fetching channels: {message}");
                self.store
                    .update(|state| {
                        state.set_channels_error(Some(message.clone()));
                        state.set_loading_channels(false);
                    })
                    .await;
                self.store.emit(MessengerEvent::Error(message));
                false
            }
        };
        self.store.emit(MessengerEvent::LoadingChanged);
        fetched
    }

    /// Requests (or looks up) the direct channel with `target_user_id`.
    /// The returned channel is not added to the local list.
    pub async fn create_channel(&self, target_user_id: &UserId) -> ClientResult<ChannelData> {
        self.store
            .update(|state| state.set_creating_channel(true))
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);

        let result = self.request_channel(target_user_id).await;

        self.store
            .update(|state| state.set_creating_channel(false))
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);
        match &result {
            Ok(channel) => info!(channel_id = %channel.channel_id, "messenger: channel ready"),
            Err(err) => error!(%target_user_id, "messenger: error creating channel: {err}"),
        }
        result
    }

    async fn request_channel(&self, target_user_id: &UserId) -> ClientResult<ChannelData> {
        const FALLBACK: &str = "Failed to create channel";
        let request = ApiRequest::post(endpoints::CREATE_CHANNEL).json(&CreateChannelRequest {
            target_user_id: target_user_id.clone(),
        })?;
        let response = self.api.request(request).await?;
        let body: CreateChannelResponse = parse_body(&response, FALLBACK)?;
        if !body.success {
            let message = body
                .message
                .as_deref()
                .or(body.error.as_deref())
                .unwrap_or(FALLBACK);
            return Err(ClientError::server(response.status, message));
        }
        body.into_channel()
            .ok_or_else(|| ClientError::Decode(format!("{FALLBACK}: response carried no channel")))
    }

    /// Replaces the channel's message list with the newest `limit` messages,
    /// oldest first. Every distinct sender is resolved once beforehand.
    pub async fn fetch_messages(&self, channel_id: &ChannelId, limit: Option<u32>) -> bool {
        let limit = limit.unwrap_or(self.settings.message_page_size);
        self.store
            .update(|state| {
                state.set_channel_loading(channel_id, true);
                state.set_messages_error(channel_id, None);
            })
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);

        let limit = limit.to_string();
        let path = with_query(
            endpoints::MESSAGES,
            &[("limit", limit.as_str()), ("channelId", channel_id.as_str())],
        );
        let result = self
            .get_data::<Vec<MessageData>>(path, "Failed to fetch messages")
            .await;

        let fetched = match result {
            Ok(messages) => {
                let mut seen = HashSet::new();
                let senders: Vec<&UserId> = messages
                    .iter()
                    .map(|message| &message.sender_user_id)
                    .filter(|sender| seen.insert(*sender))
                    .collect();
                debug!(%channel_id, senders = senders.len(), "messenger: resolving senders");
                join_all(senders.into_iter().map(|sender| self.users.resolve(sender))).await;

                let count = messages.len();
                self.store
                    .update(|state| {
                        state.replace_messages(channel_id, messages);
                        state.set_channel_loading(channel_id, false);
                    })
                    .await;
                info!(%channel_id, count, "messenger: messages fetched");
                self.store.emit(MessengerEvent::MessagesUpdated {
                    channel_id: channel_id.clone(),
                });
                true
            }
            Err(err) => {
                let message = err.to_string();
                error!(%channel_id, "messenger: error fetching messages: {message}");
                self.store
                    .update(|state| {
                        state.set_messages_error(channel_id, Some(message.clone()));
                        state.set_channel_loading(channel_id, false);
                    })
                    .await;
                self.store.emit(MessengerEvent::Error(message));
                false
            }
        };
        self.store.emit(MessengerEvent::LoadingChanged);
        fetched
    }

    /// Sends `content` to an existing channel or directly to a user.
    ///
    /// Exactly one of `channel_id` and `target_user_id` must be given. Invalid
    /// input is rejected before any request is made. The stored message is
    /// merged with overwrite semantics, so the server's copy wins over any
    /// earlier push delivery of the same message.
    pub async fn send_message(
        &self,
        content: &str,
        channel_id: Option<&ChannelId>,
        target_user_id: Option<&UserId>,
    ) -> ClientResult<MessageData> {
        let content =
            validate_outgoing(content, channel_id, target_user_id, self.settings.max_message_length)?;

        self.store
            .update(|state| state.set_sending_message(true))
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);

        let request = SendMessageRequest {
            content: content.to_string(),
            channel_id: channel_id.cloned(),
            target_user_id: target_user_id.cloned(),
        };
        let result = self.post_message(&request).await;

        self.store
            .update(|state| state.set_sending_message(false))
            .await;
        self.store.emit(MessengerEvent::LoadingChanged);

        match result {
            Ok(message) => {
                debug!(message_id = %message.message_id, channel_id = %message.channel_id, "messenger: message sent");
                self.store
                    .merge_message(&message.channel_id, message.clone(), true)
                    .await;
                Ok(message)
            }
            Err(err) => {
                error!("messenger: error sending message: {err}");
                Err(err)
            }
        }
    }

    async fn post_message(&self, body: &SendMessageRequest) -> ClientResult<MessageData> {
        let request = ApiRequest::post(endpoints::SEND_MESSAGE).json(body)?;
        let response = self.api.request(request).await?;
        let envelope: ApiEnvelope<MessageData> = parse_body(&response, "Failed to send message")?;
        unwrap_envelope(response.status, envelope, "Failed to send message")
    }

    async fn get_data<T: DeserializeOwned>(&self, path: String, fallback: &str) -> ClientResult<T> {
        let response = self.api.request(ApiRequest::get(path)).await?;
        let envelope: ApiEnvelope<T> = parse_body(&response, fallback)?;
        unwrap_envelope(response.status, envelope, fallback)
    }

    /// Runs the shared merge path used by sends and push events.
    pub async fn merge_message(
        &self,
        channel_id: &ChannelId,
        message: MessageData,
        force_overwrite: bool,
    ) -> MergeOutcome {
        self.store
            .merge_message(channel_id, message, force_overwrite)
            .await
    }

    pub async fn channels(&self) -> Vec<ChannelData> {
        self.store.read().await.channels().to_vec()
    }

    pub async fn has_channels(&self) -> bool {
        !self.store.read().await.channels().is_empty()
    }

    pub async fn is_loading_channels(&self) -> bool {
        self.store.read().await.is_loading_channels()
    }

    pub async fn channels_error(&self) -> Option<String> {
        self.store.read().await.channels_error().map(str::to_string)
    }

    pub async fn is_sending_message(&self) -> bool {
        self.store.read().await.is_sending_message()
    }

    pub async fn is_creating_channel(&self) -> bool {
        self.store.read().await.is_creating_channel()
    }

    pub async fn channel_by_id(&self, channel_id: &ChannelId) -> Option<ChannelData> {
        self.store.read().await.channel_by_id(channel_id).cloned()
    }

    pub async fn channel_by_user_id(&self, user_id: &UserId) -> Option<ChannelData> {
        self.store.read().await.channel_by_user_id(user_id).cloned()
    }

    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<MessageData> {
        self.store.read().await.messages(channel_id).to_vec()
    }

    pub async fn messages_error(&self, channel_id: &ChannelId) -> Option<String> {
        self.store
            .read()
            .await
            .messages_error(channel_id)
            .map(str::to_string)
    }

    pub async fn is_channel_loading(&self, channel_id: &ChannelId) -> bool {
        self.store.read().await.is_channel_loading(channel_id)
    }

    pub async fn search_channels(&self, query: &str) -> Vec<ChannelData> {
        self.store.read().await.search_channels(query)
    }

    pub async fn subscribe_all(&self) {
        self.subscriptions
            .subscribe(SubscriptionKey::AllChannels)
            .await;
    }

    pub async fn subscribe_channel(&self, channel_id: &ChannelId) {
        self.subscriptions
            .subscribe(SubscriptionKey::Channel(channel_id.clone()))
            .await;
    }

    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.unsubscribe(key).await
    }

    pub async fn unsubscribe_all(&self) {
        self.subscriptions.unsubscribe_all().await;
    }

    pub async fn subscription_status(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        self.subscriptions.status(key).await
    }

    pub async fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.active_keys().await
    }

    pub async fn resolve_user(&self, user_id: &UserId) -> Option<UserRecord> {
        self.users.resolve(user_id).await
    }

    pub async fn sender_name(&self, message: &MessageData) -> String {
        match self.users.resolve(&message.sender_user_id).await {
            Some(user) => user.username,
            None => UNKNOWN_SENDER.to_string(),
        }
    }

    pub async fn sender_avatar(&self, message: &MessageData) -> Option<String> {
        self.users
            .resolve(&message.sender_user_id)
            .await
            .and_then(|user| user.profile.profile_picture)
    }

    /// Closes every subscription, then wipes channels, messages, flags,
    /// errors and the user directory.
    pub async fn clear_state(&self) {
        self.subscriptions.unsubscribe_all().await;
        self.store.update(|state| state.clear()).await;
        self.users.clear().await;
        self.store.emit(MessengerEvent::StateCleared);
        info!("messenger: state cleared");
    }

    pub async fn logout(&self) {
        self.clear_state().await;
        self.session.clear().await;
        transport::logout(self.api.as_ref()).await;
    }
}

/// Trimmed content, or the first rule the input breaks.
pub fn validate_outgoing<'a>(
    content: &'a str,
    channel_id: Option<&ChannelId>,
    target_user_id: Option<&UserId>,
    max_length: usize,
) -> Result<&'a str, ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let length = trimmed.chars().count();
    if length > max_length {
        return Err(ValidationError::ContentTooLong {
            max: max_length,
            actual: length,
        });
    }
    match (channel_id, target_user_id) {
        (None, None) => Err(ValidationError::MissingTarget),
        (Some(_), Some(_)) => Err(ValidationError::ConflictingTarget),
        _ => Ok(trimmed),
    }
}

fn parse_body<T: DeserializeOwned>(response: &ApiResponse, fallback: &str) -> ClientResult<T> {
    if response.is_unavailable() {
        return Err(ClientError::Offline);
    }
    match response.json::<T>() {
        Ok(body) => Ok(body),
        Err(err) if response.is_success() => Err(err),
        Err(err) => {
            warn!(status = response.status, "messenger: unreadable error body: {err}");
            Err(ClientError::from_status(response.status, fallback))
        }
    }
}

fn unwrap_envelope<T>(status: u16, envelope: ApiEnvelope<T>, fallback: &str) -> ClientResult<T> {
    if !envelope.success {
        let message = envelope.failure_message().unwrap_or(fallback).to_string();
        return Err(ClientError::server(status, message));
    }
    envelope
        .data
        .ok_or_else(|| ClientError::Decode(format!("{fallback}: response carried no data")))
}

#[cfg(test)]
#[path = "tests/messenger_tests.rs"]
mod tests;
