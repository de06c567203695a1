use shared::domain::{ConversationState, Message, TypingEntry, UserId};

use crate::{
    cache::ConversationCache, config::ClientSettings, conversations::ConversationDirectory,
    presence::OnlineUsers, session::ConversationSession, typing::TypingTracker,
};

/// Everything the engine mutates. Owned by a single lock in `SyncClient`, so
/// every writer is serialized at this boundary.
pub struct SyncState {
    pub me: UserId,
    pub cache: ConversationCache,
    pub conversations: ConversationDirectory,
    pub typing: TypingTracker,
    pub online: OnlineUsers,
    pub session: ConversationSession,
    pub initial_load_done: bool,
}

impl SyncState {
    pub fn new(me: UserId, settings: &ClientSettings) -> Self {
        Self {
            me,
            cache: ConversationCache::new(settings.max_cached_conversations),
            conversations: ConversationDirectory::default(),
            typing: TypingTracker::new(settings.typing_ttl()),
            online: OnlineUsers::default(),
            session: ConversationSession::default(),
            initial_load_done: false,
        }
    }

    pub fn conversations(&self) -> Vec<ConversationState> {
        self.conversations.sorted()
    }

    pub fn active_conversation_messages(&self) -> Vec<Message> {
        self.session
            .active_key()
            .and_then(|key| self.cache.messages(&key))
            .map(|seq| seq.to_vec())
            .unwrap_or_default()
    }

    pub fn typing_users(&self) -> Vec<TypingEntry> {
        self.session
            .active_key()
            .map(|key| self.typing.for_conversation(&key))
            .unwrap_or_default()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.online.to_vec()
    }

    pub fn unread_count(&self) -> u32 {
        self.conversations.unread_total()
    }
}
