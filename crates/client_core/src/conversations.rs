use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationIdentity, ConversationKey, ConversationState, Message, MessageId};

/// Conversation list state. Entries are created on the first event that
/// references a conversation and live for the rest of the session.
///
/// `unread_count` per conversation moves only through `record_message`
/// (increment) and `mark_read` (saturating decrement); server summaries
/// overwrite it wholesale.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    entries: HashMap<ConversationKey, ConversationState>,
    unread_total: u32,
}

impl ConversationDirectory {
    pub fn get(&self, key: &ConversationKey) -> Option<&ConversationState> {
        self.entries.get(key)
    }

    pub fn identity(&self, key: &ConversationKey) -> Option<&ConversationIdentity> {
        self.entries.get(key).map(|state| &state.identity)
    }

    pub fn unread_total(&self) -> u32 {
        self.unread_total
    }

    /// Conversations ordered by most recent activity first.
    pub fn sorted(&self) -> Vec<ConversationState> {
        let mut states: Vec<ConversationState> = self.entries.values().cloned().collect();
        states.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.key().cmp(&b.key()))
        });
        states
    }

    pub fn ensure(
        &mut self,
        identity: &ConversationIdentity,
        now: DateTime<Utc>,
    ) -> &mut ConversationState {
        self.entries
            .entry(identity.key())
            .or_insert_with(|| ConversationState::new(identity.clone(), now))
    }

    /// Track a message that just entered the cache.
    pub fn record_message(
        &mut self,
        identity: &ConversationIdentity,
        message: &Message,
        counts_as_unread: bool,
    ) {
        let state = self.ensure(identity, message.sent_at);
        let newer = state
            .last_message
            .as_ref()
            .map(|last| last.id == message.id || last.sent_at <= message.sent_at)
            .unwrap_or(true);
        if newer {
            state.last_message = Some(message.clone());
        }
        if message.sent_at > state.last_activity {
            state.last_activity = message.sent_at;
        }
        if counts_as_unread {
            state.unread_count = state.unread_count.saturating_add(1);
        }
        self.recompute_total();
    }

    /// Swap a reconciled temp message for its confirmed counterpart in the
    /// list preview.
    pub fn reconcile_last_message(
        &mut self,
        key: &ConversationKey,
        temp_id: &MessageId,
        confirmed: &Message,
    ) {
        let Some(state) = self.entries.get_mut(key) else {
            return;
        };
        if state
            .last_message
            .as_ref()
            .is_some_and(|last| &last.id == temp_id)
        {
            state.last_message = Some(confirmed.clone());
        }
        if confirmed.sent_at > state.last_activity {
            state.last_activity = confirmed.sent_at;
        }
    }

    /// Keep the preview in sync with edits, deletions, and status changes.
    pub fn refresh_last_message(&mut self, key: &ConversationKey, current: &Message) {
        if let Some(state) = self.entries.get_mut(key) {
            if state
                .last_message
                .as_ref()
                .is_some_and(|last| last.id == current.id)
            {
                state.last_message = Some(current.clone());
            }
        }
    }

    /// Drop the preview if it points at a message that no longer exists.
    pub fn forget_message(&mut self, key: &ConversationKey, id: &MessageId) {
        if let Some(state) = self.entries.get_mut(key) {
            if state.last_message.as_ref().is_some_and(|last| &last.id == id) {
                state.last_message = None;
            }
        }
    }

    pub fn mark_read(&mut self, key: &ConversationKey, count: u32) {
        if let Some(state) = self.entries.get_mut(key) {
            state.unread_count = state.unread_count.saturating_sub(count);
        }
        self.recompute_total();
    }

    pub fn set_page_info(
        &mut self,
        key: &ConversationKey,
        has_more_older: bool,
        oldest_loaded_message_id: Option<MessageId>,
    ) {
        if let Some(state) = self.entries.get_mut(key) {
            state.has_more_older = has_more_older;
            if oldest_loaded_message_id.is_some() {
                state.oldest_loaded_message_id = oldest_loaded_message_id;
            }
        }
    }

    /// Authoritative server summary. Local pagination metadata survives.
    pub fn upsert_summary(
        &mut self,
        identity: &ConversationIdentity,
        title: Option<String>,
        last_message: Option<Message>,
        last_activity: DateTime<Utc>,
        unread_count: u32,
    ) {
        let state = self.ensure(identity, last_activity);
        if title.is_some() {
            state.title = title;
        }
        if last_message.is_some() {
            state.last_message = last_message;
        }
        state.last_activity = last_activity;
        state.unread_count = unread_count;
        self.recompute_total();
    }

    pub fn set_unread_total(&mut self, total: u32) {
        self.unread_total = total;
    }

    fn recompute_total(&mut self) {
        self.unread_total = self
            .entries
            .values()
            .fold(0u32, |sum, state| sum.saturating_add(state.unread_count));
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use shared::domain::{MessageStatus, UserId};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn message(identity: &ConversationIdentity, id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: identity.key(),
            sender_id: UserId::from("student-7"),
            sender_name: None,
            content: id.to_string(),
            sent_at: at(secs),
            status: MessageStatus::Delivered,
            is_own_message: false,
            client_message_id: None,
            parent_message_id: None,
            reactions: None,
            is_edited: false,
            is_deleted: false,
            edited_at: None,
            deleted_at: None,
            read_at: None,
            delivered_at: None,
        }
    }

    #[test]
    fn unread_never_goes_negative() {
        let identity = ConversationIdentity::direct("student-7");
        let mut directory = ConversationDirectory::default();
        directory.record_message(&identity, &message(&identity, "m-1", 1), true);
        directory.mark_read(&identity.key(), 5);
        assert_eq!(directory.get(&identity.key()).expect("entry").unread_count, 0);
        assert_eq!(directory.unread_total(), 0);
    }

    #[test]
    fn sorts_by_latest_activity_first() {
        let a = ConversationIdentity::direct("a");
        let b = ConversationIdentity::group("g-1", "class");
        let mut directory = ConversationDirectory::default();
        directory.record_message(&a, &message(&a, "m-1", 10), true);
        directory.record_message(&b, &message(&b, "m-2", 20), true);
        directory.record_message(&a, &message(&a, "m-3", 30), false);

        let keys: Vec<ConversationKey> = directory.sorted().iter().map(|s| s.key()).collect();
        assert_eq!(keys, vec![a.key(), b.key()]);
        assert_eq!(directory.unread_total(), 2);
    }

    #[test]
    fn older_message_does_not_replace_preview() {
        let identity = ConversationIdentity::direct("a");
        let mut directory = ConversationDirectory::default();
        directory.record_message(&identity, &message(&identity, "new", 30), false);
        directory.record_message(&identity, &message(&identity, "old", 10), false);
        let state = directory.get(&identity.key()).expect("entry");
        assert_eq!(state.last_message.as_ref().map(|m| m.id.as_str()), Some("new"));
        assert_eq!(state.last_activity, at(30));
    }

    #[test]
    fn server_summary_overrides_unread_and_total_is_recomputed() {
        let a = ConversationIdentity::direct("a");
        let b = ConversationIdentity::direct("b");
        let mut directory = ConversationDirectory::default();
        directory.record_message(&a, &message(&a, "m-1", 1), true);
        directory.upsert_summary(&b, Some("Bo".into()), None, at(5), 4);
        assert_eq!(directory.unread_total(), 5);

        directory.set_unread_total(9);
        assert_eq!(directory.unread_total(), 9);
        directory.upsert_summary(&a, None, None, at(6), 0);
        assert_eq!(directory.unread_total(), 4);
    }
}
