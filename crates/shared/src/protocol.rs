use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ConversationIdentity, GroupId, Message, MessageId, MessageStatus, ReactionSummary, UserId,
    },
    error::ApiError,
};

const DEFAULT_GROUP_TYPE: &str = "group";

/// Message as delivered by the backend, over the hub or REST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_type: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<ReactionSummary>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl MessageDto {
    /// Conversation this message belongs to, seen from `me`.
    pub fn identity_for(&self, me: &UserId) -> Option<ConversationIdentity> {
        if let Some(group_id) = &self.group_id {
            return Some(ConversationIdentity::Group {
                group_id: group_id.clone(),
                group_type: self
                    .group_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GROUP_TYPE.to_string()),
            });
        }
        if &self.sender_id == me {
            self.recipient_id
                .clone()
                .map(|other_user_id| ConversationIdentity::Direct { other_user_id })
        } else {
            Some(ConversationIdentity::Direct {
                other_user_id: self.sender_id.clone(),
            })
        }
    }

    pub fn to_message(&self, me: &UserId) -> Option<Message> {
        let identity = self.identity_for(me)?;
        let status = self.status.unwrap_or(if self.read_at.is_some() {
            MessageStatus::Read
        } else {
            MessageStatus::Delivered
        });
        Some(Message {
            id: self.id.clone(),
            conversation_id: identity.key(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            content: self.content.clone(),
            sent_at: self.sent_at,
            status,
            is_own_message: &self.sender_id == me,
            client_message_id: self.client_message_id.clone(),
            parent_message_id: self.parent_message_id.clone(),
            reactions: self.reactions.clone(),
            is_edited: self.is_edited,
            is_deleted: self.is_deleted,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
            read_at: self.read_at,
            delivered_at: self.delivered_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub identity: ConversationIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageDto>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageBody {
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessageBody {
    pub group_id: GroupId,
    pub group_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadBody {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletion {
    pub message_id: MessageId,
    pub deleted_at: DateTime<Utc>,
    #[serde(default)]
    pub hard_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionChange {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    pub reactions: Vec<ReactionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_type: Option<String>,
}

impl TypingNotice {
    /// Typing in a direct conversation is keyed by the typist, who is the
    /// other participant from the receiver's point of view.
    pub fn identity(&self) -> ConversationIdentity {
        match &self.group_id {
            Some(group_id) => ConversationIdentity::Group {
                group_id: group_id.clone(),
                group_type: self
                    .group_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_GROUP_TYPE.to_string()),
            },
            None => ConversationIdentity::Direct {
                other_user_id: self.user_id.clone(),
            },
        }
    }
}

/// Server-to-client push events. The tag is the hub event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", content = "arguments")]
pub enum ServerEvent {
    ReceiveDirectMessage {
        message: MessageDto,
    },
    ReceiveGroupMessage {
        message: MessageDto,
    },
    MessageDelivered {
        message_id: MessageId,
        delivered_at: DateTime<Utc>,
    },
    MessagesRead {
        message_ids: Vec<MessageId>,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    MessageEdited {
        message_id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted(MessageDeletion),
    ReactionAdded(ReactionChange),
    ReactionRemoved(ReactionChange),
    UserTyping(TypingNotice),
    UserStoppedTyping(TypingNotice),
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
    },
    UsersOnline {
        user_ids: Vec<UserId>,
    },
    ConversationUpdated {
        conversation: ConversationSummary,
    },
    UnreadCountChanged {
        total: u32,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveDirectMessage { .. } => "ReceiveDirectMessage",
            Self::ReceiveGroupMessage { .. } => "ReceiveGroupMessage",
            Self::MessageDelivered { .. } => "MessageDelivered",
            Self::MessagesRead { .. } => "MessagesRead",
            Self::MessageEdited { .. } => "MessageEdited",
            Self::MessageDeleted(_) => "MessageDeleted",
            Self::ReactionAdded(_) => "ReactionAdded",
            Self::ReactionRemoved(_) => "ReactionRemoved",
            Self::UserTyping(_) => "UserTyping",
            Self::UserStoppedTyping(_) => "UserStoppedTyping",
            Self::UserOnline { .. } => "UserOnline",
            Self::UserOffline { .. } => "UserOffline",
            Self::UsersOnline { .. } => "UsersOnline",
            Self::ConversationUpdated { .. } => "ConversationUpdated",
            Self::UnreadCountChanged { .. } => "UnreadCountChanged",
        }
    }
}

/// Client-to-server hub methods. The tag is the hub method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments")]
pub enum HubRequest {
    JoinConversation {
        conversation: ConversationIdentity,
    },
    LeaveConversation {
        conversation: ConversationIdentity,
    },
    SendDirectMessage(DirectMessageBody),
    SendGroupMessage(GroupMessageBody),
    StartTyping {
        conversation: ConversationIdentity,
    },
    StopTyping {
        conversation: ConversationIdentity,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: String,
    },
    GetOnlineUsers,
}

impl HubRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "JoinConversation",
            Self::LeaveConversation { .. } => "LeaveConversation",
            Self::SendDirectMessage(_) => "SendDirectMessage",
            Self::SendGroupMessage(_) => "SendGroupMessage",
            Self::StartTyping { .. } => "StartTyping",
            Self::StopTyping { .. } => "StopTyping",
            Self::EditMessage { .. } => "EditMessage",
            Self::DeleteMessage { .. } => "DeleteMessage",
            Self::AddReaction { .. } => "AddReaction",
            Self::RemoveReaction { .. } => "RemoveReaction",
            Self::GetOnlineUsers => "GetOnlineUsers",
        }
    }
}

/// Envelope for everything carried over the hub connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubFrame {
    Event {
        event: ServerEvent,
    },
    Invocation {
        invocation_id: String,
        request: HubRequest,
    },
    Completion {
        invocation_id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ApiError>,
    },
    Ping,
}
