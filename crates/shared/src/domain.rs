use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);

pub const TEMP_MESSAGE_ID_PREFIX: &str = "temp-";

impl MessageId {
    /// Client-issued placeholder id: `temp-<unix millis>-<random>`.
    pub fn temp(now: DateTime<Utc>) -> Self {
        Self(format!(
            "{TEMP_MESSAGE_ID_PREFIX}{}-{}",
            now.timestamp_millis(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_MESSAGE_ID_PREFIX)
    }
}

/// Discriminated conversation key. Direct conversations are keyed by the
/// other participant from the local user's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationIdentity {
    Direct {
        other_user_id: UserId,
    },
    Group {
        group_id: GroupId,
        group_type: String,
    },
}

impl ConversationIdentity {
    pub fn direct(other_user_id: impl Into<UserId>) -> Self {
        Self::Direct {
            other_user_id: other_user_id.into(),
        }
    }

    pub fn group(group_id: impl Into<GroupId>, group_type: impl Into<String>) -> Self {
        Self::Group {
            group_id: group_id.into(),
            group_type: group_type.into(),
        }
    }

    /// Canonical cache key. Stable for the lifetime of the conversation.
    pub fn key(&self) -> ConversationKey {
        match self {
            Self::Direct { other_user_id } => ConversationKey(format!("direct:{other_user_id}")),
            Self::Group {
                group_id,
                group_type,
            } => ConversationKey(format!(
                "group:{}:{group_id}",
                group_type.to_ascii_lowercase()
            )),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }
}

impl fmt::Display for ConversationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(pub String);

impl ConversationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Progress rank used to keep status updates monotonic. `Failed` sits
    /// outside the delivery progression.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Delivered => Some(1),
            Self::Read => Some(2),
            Self::Failed => None,
        }
    }

    /// Resolve two observations of the same message to the most advanced one.
    pub fn advance(self, incoming: Self) -> Self {
        match (self.rank(), incoming.rank()) {
            (Some(current), Some(next)) if next < current => self,
            _ => incoming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
    #[serde(default)]
    pub reacted_by_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationKey,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_own_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
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

impl Message {
    pub fn is_unread_inbound(&self) -> bool {
        !self.is_own_message && self.status != MessageStatus::Read
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub identity: ConversationIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    pub last_activity: DateTime<Utc>,
    pub unread_count: u32,
    pub has_more_older: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_loaded_message_id: Option<MessageId>,
}

impl ConversationState {
    pub fn new(identity: ConversationIdentity, last_activity: DateTime<Utc>) -> Self {
        Self {
            identity,
            title: None,
            last_message: None,
            last_activity,
            unread_count: 0,
            has_more_older: true,
            oldest_loaded_message_id: None,
        }
    }

    pub fn key(&self) -> ConversationKey {
        self.identity.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEntry {
    pub conversation_id: ConversationKey,
    pub user_id: UserId,
    pub user_name: String,
    pub started_at: DateTime<Utc>,
}
