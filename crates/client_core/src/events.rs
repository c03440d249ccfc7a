use shared::domain::{ChannelId, SubscriptionKey};

use crate::subscriptions::SubscriptionStatus;

/// Change notifications for UI consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerEvent {
    ChannelsUpdated,
    MessagesUpdated { channel_id: ChannelId },
    LoadingChanged,
    /// `status` is `None` once the subscription is closed.
    SubscriptionStatusChanged {
        key: SubscriptionKey,
        status: Option<SubscriptionStatus>,
    },
    Error(String),
    StateCleared,
}
