//! Active-conversation bookkeeping and read-marking.

use chrono::{DateTime, Utc};
use shared::domain::{ConversationIdentity, ConversationKey, Message, MessageId};

use crate::{
    cache::{ConversationCache, MessagePatch, PatchOutcome},
    conversations::ConversationDirectory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Active,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    phase: SessionPhase,
    active: Option<ConversationIdentity>,
    focused: bool,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            active: None,
            focused: true,
        }
    }
}

impl ConversationSession {
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn active(&self) -> Option<&ConversationIdentity> {
        self.active.as_ref()
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        self.active.as_ref().map(ConversationIdentity::key)
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.active_key().as_ref() == Some(key)
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    /// Inbound messages in `key` should be read-marked as they arrive.
    pub fn reads_live(&self, key: &ConversationKey) -> bool {
        self.phase == SessionPhase::Active && self.focused && self.is_active(key)
    }

    /// Start joining `identity`; returns the conversation being switched away
    /// from, if any.
    pub fn begin_join(&mut self, identity: ConversationIdentity) -> Option<ConversationIdentity> {
        let previous = self.active.take().filter(|current| current != &identity);
        self.active = Some(identity);
        self.phase = SessionPhase::Joining;
        previous
    }

    /// Finish a join. Ignored when another join superseded this one.
    pub fn complete_join(&mut self, identity: &ConversationIdentity) -> bool {
        if self.active.as_ref() != Some(identity) {
            return false;
        }
        self.phase = SessionPhase::Active;
        true
    }

    pub fn leave(&mut self) -> Option<ConversationIdentity> {
        self.phase = SessionPhase::Idle;
        self.active.take()
    }

    pub fn set_focused(&mut self, focused: bool) -> bool {
        let changed = self.focused != focused;
        self.focused = focused;
        changed
    }
}

/// Ids of inbound messages in `key` not yet read.
pub fn unread_inbound_ids(cache: &ConversationCache, key: &ConversationKey) -> Vec<MessageId> {
    cache
        .messages(key)
        .map(|seq| {
            seq.iter()
                .filter(|message| message.is_unread_inbound())
                .map(|message| message.id.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Mark `ids` read locally and lower the owning conversations' unread counts
/// by the number of messages that actually flipped. Returns that number.
pub fn apply_read(
    cache: &mut ConversationCache,
    conversations: &mut ConversationDirectory,
    ids: &[MessageId],
    read_at: DateTime<Utc>,
) -> u32 {
    let patch = MessagePatch::read(read_at);
    let mut flipped = 0;
    for id in ids {
        if let PatchOutcome::Applied {
            conversation,
            previous,
            current,
        } = cache.patch(id, &patch)
        {
            conversations.refresh_last_message(&conversation, &current);
            if flipped_to_read(&previous, &current) {
                conversations.mark_read(&conversation, 1);
                flipped += 1;
            }
        }
    }
    flipped
}

fn flipped_to_read(previous: &Message, current: &Message) -> bool {
    previous.is_unread_inbound() && !current.is_unread_inbound()
}
