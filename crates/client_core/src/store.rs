use std::collections::HashMap;

use shared::{
    domain::{ChannelId, UserId},
    protocol::{ChannelData, LatestMessage, MessageData},
};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};

use crate::events::MessengerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

/// Authoritative client view of channels and their message lists.
#[derive(Debug, Default, Clone)]
pub struct ChannelStore {
    channels: Vec<ChannelData>,
    messages: HashMap<ChannelId, Vec<MessageData>>,
    loading_channels: bool,
    loading_messages: HashMap<ChannelId, bool>,
    sending_message: bool,
    creating_channel: bool,
    channels_error: Option<String>,
    messages_errors: HashMap<ChannelId, String>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replace in server order; channels missing from `channels` disappear.
    pub fn replace_channels(&mut self, channels: Vec<ChannelData>) {
        self.channels = channels;
    }

    /// Stores a newest-first server page in display (oldest-first) order.
    pub fn replace_messages(&mut self, channel_id: &ChannelId, mut newest_first: Vec<MessageData>) {
        newest_first.reverse();
        self.messages.insert(channel_id.clone(), newest_first);
    }

    /// Insert-or-replace by message identifier.
    ///
    /// An existing entry is only replaced when `force_overwrite` is set;
    /// otherwise the stored copy wins and nothing changes. After an insert or
    /// replace the parent channel's latest-message pointer moves forward when
    /// the message is at least as new as the current pointer, and the channel
    /// list is re-sorted. Unknown channels only gain a message list.
    pub fn merge_message(
        &mut self,
        channel_id: &ChannelId,
        message: MessageData,
        force_overwrite: bool,
    ) -> MergeOutcome {
        let list = self.messages.entry(channel_id.clone()).or_default();
        let outcome = match list
            .iter()
            .position(|existing| existing.message_id == message.message_id)
        {
            Some(_) if !force_overwrite => return MergeOutcome::Unchanged,
            Some(index) => {
                list[index] = message.clone();
                MergeOutcome::Replaced
            }
            None => {
                list.push(message.clone());
                MergeOutcome::Inserted
            }
        };

        self.advance_latest_message(channel_id, &message);
        self.sort_channels();
        outcome
    }

    fn advance_latest_message(&mut self, channel_id: &ChannelId, message: &MessageData) {
        let Some(channel) = self
            .channels
            .iter_mut()
            .find(|channel| &channel.channel_id == channel_id)
        else {
            return;
        };
        let is_newest = channel
            .latest_message
            .as_ref()
            .map_or(true, |latest| message.created_at >= latest.created_at);
        if is_newest {
            channel.latest_message = Some(LatestMessage::from(message));
            channel.updated_at = message.created_at;
        }
    }

    /// Most recently active first; equal times keep their relative order.
    pub fn sort_channels(&mut self) {
        self.channels
            .sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    }

    pub fn channels(&self) -> &[ChannelData] {
        &self.channels
    }

    pub fn messages(&self, channel_id: &ChannelId) -> &[MessageData] {
        self.messages
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn channel_by_id(&self, channel_id: &ChannelId) -> Option<&ChannelData> {
        self.channels
            .iter()
            .find(|channel| &channel.channel_id == channel_id)
    }

    pub fn channel_by_user_id(&self, user_id: &UserId) -> Option<&ChannelData> {
        self.channels.iter().find(|channel| {
            channel
                .other_users
                .iter()
                .any(|user| &user.user_id == user_id)
        })
    }

    /// Case-insensitive match on participant names and latest message text.
    pub fn search_channels(&self, query: &str) -> Vec<ChannelData> {
        if query.trim().is_empty() {
            return self.channels.clone();
        }
        let term = query.to_lowercase();
        let contains = |text: &str| text.to_lowercase().contains(&term);

        self.channels
            .iter()
            .filter(|channel| {
                let user_match = channel.other_users.iter().any(|user| {
                    contains(&user.username)
                        || user.profile.as_ref().is_some_and(|profile| {
                            contains(&profile.first_name) || contains(&profile.last_name)
                        })
                });
                let message_match = channel
                    .latest_message
                    .as_ref()
                    .is_some_and(|latest| contains(&latest.content));
                user_match || message_match
            })
            .cloned()
            .collect()
    }

    pub fn is_loading_channels(&self) -> bool {
        self.loading_channels
    }

    pub fn set_loading_channels(&mut self, loading: bool) {
        self.loading_channels = loading;
    }

    pub fn channels_error(&self) -> Option<&str> {
        self.channels_error.as_deref()
    }

    pub fn set_channels_error(&mut self, error: Option<String>) {
        self.channels_error = error;
    }

    pub fn is_channel_loading(&self, channel_id: &ChannelId) -> bool {
        self.loading_messages
            .get(channel_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_channel_loading(&mut self, channel_id: &ChannelId, loading: bool) {
        self.loading_messages.insert(channel_id.clone(), loading);
    }

    pub fn messages_error(&self, channel_id: &ChannelId) -> Option<&str> {
        self.messages_errors.get(channel_id).map(String::as_str)
    }

    pub fn set_messages_error(&mut self, channel_id: &ChannelId, error: Option<String>) {
        match error {
            Some(error) => {
                self.messages_errors.insert(channel_id.clone(), error);
            }
            None => {
                self.messages_errors.remove(channel_id);
            }
        }
    }

    pub fn is_sending_message(&self) -> bool {
        self.sending_message
    }

    pub fn set_sending_message(&mut self, sending: bool) {
        self.sending_message = sending;
    }

    pub fn is_creating_channel(&self) -> bool {
        self.creating_channel
    }

    pub fn set_creating_channel(&mut self, creating: bool) {
        self.creating_channel = creating;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The store behind a lock, publishing a [`MessengerEvent`] for every change.
/// Fetch responses and push events both write through here.
pub struct SharedStore {
    state: RwLock<ChannelStore>,
    events: broadcast::Sender<MessengerEvent>,
}

impl SharedStore {
    pub fn new(events: broadcast::Sender<MessengerEvent>) -> Self {
        Self {
            state: RwLock::new(ChannelStore::new()),
            events,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ChannelStore> {
        self.state.read().await
    }

    pub async fn update<R>(&self, apply: impl FnOnce(&mut ChannelStore) -> R) -> R {
        let mut state = self.state.write().await;
        apply(&mut state)
    }

    pub async fn merge_message(
        &self,
        channel_id: &ChannelId,
        message: MessageData,
        force_overwrite: bool,
    ) -> MergeOutcome {
        let (outcome, channel_known) = {
            let mut state = self.state.write().await;
            let outcome = state.merge_message(channel_id, message, force_overwrite);
            (outcome, state.channel_by_id(channel_id).is_some())
        };
        if outcome != MergeOutcome::Unchanged {
            self.emit(MessengerEvent::MessagesUpdated {
                channel_id: channel_id.clone(),
            });
            if channel_known {
                self.emit(MessengerEvent::ChannelsUpdated);
            }
        }
        outcome
    }

    pub fn emit(&self, event: MessengerEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
