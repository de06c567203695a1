use std::{collections::HashMap, time::Duration};

use shared::domain::{ConversationKey, TypingEntry, UserId};

struct Tracked {
    entry: TypingEntry,
    generation: u64,
}

/// Ephemeral "is typing" set. Entries expire `ttl` after their last refresh
/// unless an explicit stop removes them earlier.
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<(ConversationKey, UserId), Tracked>,
    generation: u64,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            generation: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh an entry. Returns the generation an expiry timer
    /// must present to `expire`.
    pub fn start(&mut self, entry: TypingEntry) -> u64 {
        self.generation += 1;
        let key = (entry.conversation_id.clone(), entry.user_id.clone());
        self.entries.insert(
            key,
            Tracked {
                entry,
                generation: self.generation,
            },
        );
        self.generation
    }

    pub fn stop(&mut self, conversation: &ConversationKey, user: &UserId) -> bool {
        self.entries
            .remove(&(conversation.clone(), user.clone()))
            .is_some()
    }

    /// Timer callback. A refresh since the timer was armed wins.
    pub fn expire(
        &mut self,
        conversation: &ConversationKey,
        user: &UserId,
        generation: u64,
    ) -> bool {
        let key = (conversation.clone(), user.clone());
        match self.entries.get(&key) {
            Some(tracked) if tracked.generation == generation => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn for_conversation(&self, conversation: &ConversationKey) -> Vec<TypingEntry> {
        let mut entries: Vec<TypingEntry> = self
            .entries
            .values()
            .filter(|tracked| &tracked.entry.conversation_id == conversation)
            .map(|tracked| tracked.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        entries
    }
}
