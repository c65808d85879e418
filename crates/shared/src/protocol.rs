use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::UserId,
    error::ProtocolError,
};

/// Events emitted by the client over the push channel.
///
/// Frames are encoded as `{"event": <name>, "data": <payload>}` with
/// camelCase names, the transport's convention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    RegisterUser { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        temp_id: i64,
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<i64>,
    },
    /// Batched read receipt. `sender_id` is the peer whose messages were
    /// read; `receiver_id` is the reading user.
    #[serde(rename_all = "camelCase")]
    MessageRead {
        sender_id: UserId,
        receiver_id: UserId,
        message_ids: Vec<i64>,
    },
}

/// A single entry of a batched inbound read acknowledgement. The
/// timestamp is the server clock at read time, not the client's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: i64,
    pub read_timestamp: DateTime<Utc>,
}

/// Events delivered by the server over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    #[serde(rename_all = "camelCase")]
    ReceiveMessage {
        sender_id: UserId,
        message_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_height: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    MessageSaved { temp_id: i64, message_id: i64 },
    #[serde(rename_all = "camelCase")]
    MessageDelivered {
        message_id: i64,
        delivered_timestamp: DateTime<Utc>,
    },
    /// `receiver_id` is the peer who read the messages.
    #[serde(rename_all = "camelCase")]
    MessageRead {
        receiver_id: UserId,
        message_ids: Vec<ReadReceipt>,
    },
    #[serde(rename_all = "camelCase")]
    Typing { sender_id: UserId, receiver_id: UserId },
    #[serde(rename_all = "camelCase")]
    StopTyping { sender_id: UserId, receiver_id: UserId },
    #[serde(rename_all = "camelCase")]
    UnreadMessagesCount { unread_count: u32 },
    #[serde(rename_all = "camelCase")]
    UnreadCountResponse {
        target_user_id: UserId,
        unread_count: u32,
    },
}

impl OutboundEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl InboundEvent {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Decode)
    }
}

/// History wire form of a message, as returned by `GET /messages/{userId}`.
/// REST payloads use snake_case, unlike the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: i64,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_text: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(rename = "isOnline", default)]
    pub is_online: bool,
}

/// Full roster and history snapshot from `GET /messages/{userId}`.
/// Timelines are keyed by the peer's user id, stringified by the JSON
/// object encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesSnapshot {
    pub users: Vec<PeerSummary>,
    pub messages: HashMap<String, Vec<MessageRecord>>,
}

/// Response of `POST /messages/media`, resolved before the optimistic
/// insert of an attachment message. Unlike the rest of the REST
/// surface, the media endpoint answers in camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUploadResponse {
    pub file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
}

/// Response of `GET /notifications/count/{userId}`, the session-start
/// seed for both unread counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountsResponse {
    pub unread_notifications: u32,
    pub unread_messages: u32,
}
