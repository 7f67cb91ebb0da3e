use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Message, MessageId, Reactions, Username};

/// Client to service events on the duplex channel.
///
/// Frames are encoded as `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinRoom(Username),
    SendMessage(OutgoingMessage),
    Typing(TypingSignal),
    MarkAsRead(MarkAsRead),
    ReactToMessage(ReactToMessage),
    DeleteMessage(DeleteMessage),
    EditMessage(EditMessage),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::SendMessage(_) => "send_message",
            Self::Typing(_) => "typing",
            Self::MarkAsRead(_) => "mark_as_read",
            Self::ReactToMessage(_) => "react_to_message",
            Self::DeleteMessage(_) => "delete_message",
            Self::EditMessage(_) => "edit_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub sender: Username,
    pub receiver: Username,
    #[serde(rename = "message")]
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub is_typing: bool,
    pub to: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsRead {
    pub message_ids: Vec<MessageId>,
    pub sender: Username,
    pub receiver: Username,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactToMessage {
    pub message_id: MessageId,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub message_id: MessageId,
    pub new_content: String,
}

/// Service to client events on the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(Message),
    UserStatus(UserStatus),
    Typing(TypingNotice),
    MessageReacted(MessageReacted),
    MessageDeleted(MessageDeleted),
    MessageEdited(MessageEdited),
    MessagesRead(MessagesRead),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveMessage(_) => "receive_message",
            Self::UserStatus(_) => "user_status",
            Self::Typing(_) => "typing",
            Self::MessageReacted(_) => "message_reacted",
            Self::MessageDeleted(_) => "message_deleted",
            Self::MessageEdited(_) => "message_edited",
            Self::MessagesRead(_) => "messages_read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub username: Username,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub from: Username,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReacted {
    pub message_id: MessageId,
    pub reactions: Reactions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEdited {
    pub message_id: MessageId,
    pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesRead {
    pub message_ids: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<Username>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

pub type UnreadCounts = HashMap<Username, u32>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMessagesQuery {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_user: Option<Username>,
}
