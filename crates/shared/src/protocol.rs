use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, MessageId, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Participant summary embedded in channels and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
}

/// User directory entry as returned by the public user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub profile: UserProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserSummary>,
}

/// Channel pointer to its most recent message, without sender metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub sender_user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MessageData> for LatestMessage {
    fn from(message: &MessageData) -> Self {
        Self {
            message_id: message.message_id.clone(),
            channel_id: message.channel_id.clone(),
            sender_user_id: message.sender_user_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            updated_at: message.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelData {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub owner_user_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub latest_message: Option<LatestMessage>,
    #[serde(default)]
    pub other_users: Vec<UserSummary>,
}

impl ChannelData {
    /// Latest message time if the channel has one, otherwise its creation time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.latest_message
            .as_ref()
            .map(|message| message.created_at)
            .unwrap_or(self.created_at)
    }
}

/// Response envelope shared by the messaging endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: None,
            message: Some(message.into()),
        }
    }

    /// Server-provided failure text, preferring `message` over `error`.
    pub fn failure_message(&self) -> Option<&str> {
        self.message.as_deref().or(self.error.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLookupResponse {
    pub success: bool,
    #[serde(default)]
    pub user: Option<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub target_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedChannel {
    pub channel_id: ChannelId,
    pub channel_data: ChannelData,
}

/// Channel creation answers either `{ data: { channelId, channelData } }`
/// or the older `{ channel }` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<CreatedChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CreateChannelResponse {
    pub fn into_channel(self) -> Option<ChannelData> {
        self.data
            .map(|created| created.channel_data)
            .or(self.channel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
}

/// Payload carried by one server-sent event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Connected {
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },
    Heartbeat {
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },
    Message {
        data: MessageData,
        channel_id: ChannelId,
    },
}
