//! Versioned per-conversation message cache.
//!
//! Every mutation that changes something publishes a new top-level map and
//! bumps `version`. Sequences are shared through `Arc` and replaced, never
//! edited in place, so a `CacheSnapshot` taken earlier stays valid.
//!
//! Invariants per conversation: messages are unique by id and ordered by
//! `sent_at`, ties kept in insertion order.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::domain::{
    ConversationKey, Message, MessageId, MessageStatus, ReactionSummary, UserId,
};
use tracing::debug;

pub type MessageSequence = Arc<Vec<Message>>;
pub type ConversationMap = HashMap<ConversationKey, MessageSequence>;

#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub version: u64,
    pub conversations: Arc<ConversationMap>,
}

impl CacheSnapshot {
    pub fn messages(&self, key: &ConversationKey) -> &[Message] {
        self.conversations
            .get(key)
            .map(|seq| seq.as_slice())
            .unwrap_or_default()
    }
}

/// Partial update applied to one message. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub content: Option<String>,
    pub is_edited: Option<bool>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: Option<bool>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub reactions: Option<Vec<ReactionSummary>>,
}

impl MessagePatch {
    pub fn delivered(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MessageStatus::Delivered),
            delivered_at: Some(at),
            ..Self::default()
        }
    }

    pub fn read(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(MessageStatus::Read),
            read_at: Some(at),
            ..Self::default()
        }
    }

    pub fn edited(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            content: Some(content.into()),
            is_edited: Some(true),
            edited_at: Some(at),
            ..Self::default()
        }
    }

    pub fn soft_deleted(at: DateTime<Utc>) -> Self {
        Self {
            is_deleted: Some(true),
            deleted_at: Some(at),
            ..Self::default()
        }
    }

    pub fn reactions(reactions: Vec<ReactionSummary>) -> Self {
        Self {
            reactions: Some(reactions),
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            status: Some(MessageStatus::Failed),
            ..Self::default()
        }
    }

    fn apply(&self, current: &Message) -> Message {
        let mut next = current.clone();
        if let Some(status) = self.status {
            next.status = current.status.advance(status);
        }
        if let Some(at) = self.read_at {
            if next.status == MessageStatus::Read {
                next.read_at = Some(at);
            }
        }
        if let Some(at) = self.delivered_at {
            next.delivered_at.get_or_insert(at);
        }

        // An edit older than the one already applied lost the race.
        let stale_edit = matches!(
            (self.edited_at, current.edited_at),
            (Some(incoming), Some(known)) if incoming < known
        );
        if !stale_edit {
            if let Some(content) = &self.content {
                next.content = content.clone();
            }
            if let Some(is_edited) = self.is_edited {
                next.is_edited = is_edited;
            }
            if self.edited_at.is_some() {
                next.edited_at = self.edited_at;
            }
        }

        if let Some(is_deleted) = self.is_deleted {
            next.is_deleted = next.is_deleted || is_deleted;
        }
        if let Some(at) = self.deleted_at {
            next.deleted_at.get_or_insert(at);
        }
        if let Some(reactions) = &self.reactions {
            next.reactions = Some(reactions.clone());
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied {
        conversation: ConversationKey,
        previous: Message,
        current: Message,
    },
    Unchanged {
        conversation: ConversationKey,
    },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Where the next older page starts for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub next_page: u32,
    pub has_more_older: bool,
    pub oldest_loaded_message_id: Option<MessageId>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            next_page: 1,
            has_more_older: true,
            oldest_loaded_message_id: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConversationCache {
    version: u64,
    conversations: Arc<ConversationMap>,
    cursors: HashMap<ConversationKey, PageCursor>,
    last_touched: HashMap<ConversationKey, u64>,
    clock: u64,
    max_conversations: usize,
    pinned: Option<ConversationKey>,
}

impl ConversationCache {
    /// `max_conversations == 0` disables eviction.
    pub fn new(max_conversations: usize) -> Self {
        Self {
            max_conversations,
            ..Self::default()
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            version: self.version,
            conversations: Arc::clone(&self.conversations),
        }
    }

    pub fn messages(&self, key: &ConversationKey) -> Option<MessageSequence> {
        self.conversations.get(key).cloned()
    }

    pub fn is_empty_for(&self, key: &ConversationKey) -> bool {
        self.conversations
            .get(key)
            .map(|seq| seq.is_empty())
            .unwrap_or(true)
    }

    pub fn find(&self, id: &MessageId) -> Option<(&ConversationKey, &Message)> {
        self.conversations.iter().find_map(|(key, seq)| {
            seq.iter()
                .find(|message| &message.id == id)
                .map(|message| (key, message))
        })
    }

    pub fn cursor(&self, key: &ConversationKey) -> PageCursor {
        self.cursors.get(key).cloned().unwrap_or_default()
    }

    pub fn set_cursor(&mut self, key: &ConversationKey, cursor: PageCursor) {
        self.cursors.insert(key.clone(), cursor);
    }

    /// Keep `key` out of eviction. Used for the active conversation.
    pub fn pin(&mut self, key: Option<ConversationKey>) {
        self.pinned = key;
    }

    /// Cold-start load: the sequence becomes exactly `messages`.
    pub fn replace(&mut self, key: &ConversationKey, messages: Vec<Message>) {
        let mut seq: Vec<Message> = Vec::with_capacity(messages.len());
        for message in messages {
            match seq.iter().position(|existing| existing.id == message.id) {
                Some(idx) => seq[idx] = message,
                None => seq.push(message),
            }
        }
        seq.sort_by_key(|message| message.sent_at);

        let mut next = (*self.conversations).clone();
        next.insert(key.clone(), Arc::new(seq));
        self.commit(key, next);
    }

    /// Pagination load. Messages already cached win over the page, so local
    /// optimistic state is never overwritten. Returns how many were added.
    pub fn merge(&mut self, key: &ConversationKey, messages: Vec<Message>) -> usize {
        let current = self.messages(key).unwrap_or_default();
        let mut seq: Vec<Message> = current.to_vec();
        let mut added = 0;
        for message in messages {
            if seq.iter().any(|existing| existing.id == message.id) {
                continue;
            }
            seq.push(message);
            added += 1;
        }
        if added == 0 && self.conversations.contains_key(key) {
            return 0;
        }
        seq.sort_by_key(|message| message.sent_at);

        let mut next = (*self.conversations).clone();
        next.insert(key.clone(), Arc::new(seq));
        self.commit(key, next);
        added
    }

    /// Add or update one message, keeping chronological order.
    pub fn upsert(&mut self, key: &ConversationKey, message: Message) -> UpsertOutcome {
        let current = self.messages(key).unwrap_or_default();
        let mut seq: Vec<Message> = current.to_vec();

        let outcome = match seq.iter().position(|existing| existing.id == message.id) {
            Some(idx) => {
                let merged = merge_observations(&seq[idx], message);
                if merged == seq[idx] {
                    return UpsertOutcome::Unchanged;
                }
                if merged.sent_at == seq[idx].sent_at {
                    seq[idx] = merged;
                } else {
                    seq.remove(idx);
                    insert_ordered(&mut seq, merged);
                }
                UpsertOutcome::Updated
            }
            None => {
                insert_ordered(&mut seq, message);
                UpsertOutcome::Inserted
            }
        };

        let mut next = (*self.conversations).clone();
        next.insert(key.clone(), Arc::new(seq));
        self.commit(key, next);
        outcome
    }

    /// Apply `patch` to the message with `id` in whichever conversation holds
    /// it. A missing message is a benign no-op.
    pub fn patch(&mut self, id: &MessageId, patch: &MessagePatch) -> PatchOutcome {
        let Some((key, idx)) = self.locate(id) else {
            debug!(message_id = %id, "cache: patch target not cached");
            return PatchOutcome::NotFound;
        };
        let Some(seq) = self.conversations.get(&key) else {
            return PatchOutcome::NotFound;
        };

        let previous = seq[idx].clone();
        let current = patch.apply(&previous);
        if current == previous {
            return PatchOutcome::Unchanged { conversation: key };
        }

        let mut updated: Vec<Message> = seq.to_vec();
        updated[idx] = current.clone();
        let mut next = (*self.conversations).clone();
        next.insert(key.clone(), Arc::new(updated));
        self.commit(&key, next);

        PatchOutcome::Applied {
            conversation: key,
            previous,
            current,
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<(ConversationKey, Message)> {
        let (key, idx) = self.locate(id)?;
        let seq = self.conversations.get(&key)?;
        let mut updated: Vec<Message> = seq.to_vec();
        let removed = updated.remove(idx);

        let mut next = (*self.conversations).clone();
        next.insert(key.clone(), Arc::new(updated));
        self.commit(&key, next);
        Some((key, removed))
    }

    /// Temp message in `key` whose id was echoed back as `client_message_id`.
    pub fn find_temp_by_client_id(
        &self,
        key: &ConversationKey,
        client_message_id: &str,
    ) -> Option<MessageId> {
        self.conversations.get(key)?.iter().find_map(|message| {
            (message.id.is_temp() && message.id.as_str() == client_message_id)
                .then(|| message.id.clone())
        })
    }

    /// Best-effort match of a server echo against a pending temp message:
    /// same sender, same content, and sent within `window` of each other.
    pub fn find_pending_echo(
        &self,
        key: &ConversationKey,
        sender: &UserId,
        content: &str,
        sent_at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Option<MessageId> {
        self.conversations.get(key)?.iter().find_map(|message| {
            let close_enough = (message.sent_at - sent_at).abs() < window;
            (message.id.is_temp()
                && &message.sender_id == sender
                && message.content == content
                && close_enough)
                .then(|| message.id.clone())
        })
    }

    fn locate(&self, id: &MessageId) -> Option<(ConversationKey, usize)> {
        self.conversations.iter().find_map(|(key, seq)| {
            seq.iter()
                .position(|message| &message.id == id)
                .map(|idx| (key.clone(), idx))
        })
    }

    fn commit(&mut self, touched: &ConversationKey, mut next: ConversationMap) {
        self.clock += 1;
        self.last_touched.insert(touched.clone(), self.clock);
        self.evict_into(&mut next);
        self.conversations = Arc::new(next);
        self.version += 1;
    }

    fn evict_into(&mut self, next: &mut ConversationMap) {
        if self.max_conversations == 0 {
            return;
        }
        while next.len() > self.max_conversations {
            let victim = next
                .keys()
                .filter(|key| self.pinned.as_ref() != Some(*key))
                .min_by_key(|key| self.last_touched.get(*key).copied().unwrap_or(0))
                .cloned();
            let Some(victim) = victim else {
                return;
            };
            debug!(conversation = %victim, "cache: evicting inactive conversation");
            next.remove(&victim);
            self.cursors.remove(&victim);
            self.last_touched.remove(&victim);
        }
    }
}

fn insert_ordered(seq: &mut Vec<Message>, message: Message) {
    let idx = seq
        .iter()
        .position(|existing| existing.sent_at > message.sent_at)
        .unwrap_or(seq.len());
    seq.insert(idx, message);
}

/// Combine a cached message with a fresh observation of the same id.
fn merge_observations(current: &Message, mut incoming: Message) -> Message {
    incoming.status = current.status.advance(incoming.status);
    if incoming.reactions.is_none() {
        incoming.reactions = current.reactions.clone();
    }
    if incoming.read_at.is_none() {
        incoming.read_at = current.read_at;
    }
    if incoming.delivered_at.is_none() {
        incoming.delivered_at = current.delivered_at;
    }
    if incoming.sender_name.is_none() {
        incoming.sender_name = current.sender_name.clone();
    }
    if let (Some(known), Some(seen)) = (current.edited_at, incoming.edited_at) {
        if seen < known {
            incoming.content = current.content.clone();
            incoming.edited_at = current.edited_at;
            incoming.is_edited = current.is_edited;
        }
    } else if current.edited_at.is_some() && incoming.edited_at.is_none() {
        incoming.content = current.content.clone();
        incoming.edited_at = current.edited_at;
        incoming.is_edited = current.is_edited;
    }
    incoming.is_deleted = incoming.is_deleted || current.is_deleted;
    if incoming.deleted_at.is_none() {
        incoming.deleted_at = current.deleted_at;
    }
    incoming
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn key() -> ConversationKey {
        ConversationKey("direct:student-7".into())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: key(),
            sender_id: UserId::from("student-7"),
            sender_name: None,
            content: format!("body {id}"),
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

    fn ids(cache: &ConversationCache) -> Vec<String> {
        cache
            .messages(&key())
            .expect("sequence")
            .iter()
            .map(|m| m.id.0.clone())
            .collect()
    }

    fn assert_chronological(cache: &ConversationCache) {
        let seq = cache.messages(&key()).expect("sequence");
        assert!(seq.windows(2).all(|w| w[0].sent_at <= w[1].sent_at));
    }

    #[test]
    fn upsert_inserts_before_first_later_message() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        cache.upsert(&key(), msg("c", 30));
        cache.upsert(&key(), msg("b", 20));
        cache.upsert(&key(), msg("z", 0));
        assert_eq!(ids(&cache), vec!["z", "a", "b", "c"]);
        assert_chronological(&cache);
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("first", 10));
        cache.upsert(&key(), msg("second", 10));
        cache.upsert(&key(), msg("third", 10));
        assert_eq!(ids(&cache), vec!["first", "second", "third"]);
    }

    #[test]
    fn every_change_publishes_a_new_snapshot() {
        let mut cache = ConversationCache::new(0);
        let before = cache.snapshot();
        cache.upsert(&key(), msg("a", 10));
        let after = cache.snapshot();

        assert_eq!(after.version, before.version + 1);
        assert!(!Arc::ptr_eq(&before.conversations, &after.conversations));
        assert!(before.messages(&key()).is_empty());
        assert_eq!(after.messages(&key()).len(), 1);
    }

    #[test]
    fn repeated_upsert_is_unchanged_and_keeps_version() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        let version = cache.version();
        assert_eq!(cache.upsert(&key(), msg("a", 10)), UpsertOutcome::Unchanged);
        assert_eq!(cache.version(), version);
    }

    #[test]
    fn upsert_does_not_regress_status() {
        let mut cache = ConversationCache::new(0);
        let mut read = msg("a", 10);
        read.status = MessageStatus::Read;
        cache.upsert(&key(), read);
        cache.upsert(&key(), msg("a", 10));
        assert_eq!(
            cache.messages(&key()).expect("seq")[0].status,
            MessageStatus::Read
        );
    }

    #[test]
    fn upsert_with_moved_timestamp_reorders() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        cache.upsert(&key(), msg("b", 20));
        cache.upsert(&key(), msg("a", 30));
        assert_eq!(ids(&cache), vec!["b", "a"]);
    }

    #[test]
    fn merge_dedupes_and_keeps_local_state() {
        let mut cache = ConversationCache::new(0);
        let mut local = msg("b", 20);
        local.content = "local edit".into();
        cache.upsert(&key(), local);

        let added = cache.merge(&key(), vec![msg("a", 10), msg("b", 20), msg("c", 5)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&cache), vec!["c", "a", "b"]);
        assert_eq!(cache.messages(&key()).expect("seq")[2].content, "local edit");
    }

    #[test]
    fn merge_of_known_page_does_not_bump_version() {
        let mut cache = ConversationCache::new(0);
        cache.merge(&key(), vec![msg("a", 10)]);
        let version = cache.version();
        assert_eq!(cache.merge(&key(), vec![msg("a", 10)]), 0);
        assert_eq!(cache.version(), version);
    }

    #[test]
    fn replace_sorts_and_drops_duplicates() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("stale", 1));
        cache.replace(&key(), vec![msg("b", 20), msg("a", 10), msg("b", 20)]);
        assert_eq!(ids(&cache), vec!["a", "b"]);
    }

    #[test]
    fn patch_missing_message_is_a_noop() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        let version = cache.version();
        let outcome = cache.patch(
            &MessageId::from("older-page"),
            &MessagePatch::reactions(Vec::new()),
        );
        assert_eq!(outcome, PatchOutcome::NotFound);
        assert_eq!(cache.version(), version);
    }

    #[test]
    fn patch_replaces_message_without_touching_old_snapshot() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        let before = cache.snapshot();

        let outcome = cache.patch(&MessageId::from("a"), &MessagePatch::read(at(60)));
        assert!(matches!(outcome, PatchOutcome::Applied { .. }));
        assert_eq!(before.messages(&key())[0].status, MessageStatus::Delivered);
        let patched = &cache.messages(&key()).expect("seq")[0];
        assert_eq!(patched.status, MessageStatus::Read);
        assert_eq!(patched.read_at, Some(at(60)));
    }

    #[test]
    fn late_delivery_receipt_does_not_downgrade_read() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        cache.patch(&MessageId::from("a"), &MessagePatch::read(at(60)));
        cache.patch(&MessageId::from("a"), &MessagePatch::delivered(at(50)));
        let message = &cache.messages(&key()).expect("seq")[0];
        assert_eq!(message.status, MessageStatus::Read);
        assert_eq!(message.delivered_at, Some(at(50)));
    }

    #[test]
    fn stale_edit_is_ignored() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        cache.patch(&MessageId::from("a"), &MessagePatch::edited("v2", at(40)));
        cache.patch(&MessageId::from("a"), &MessagePatch::edited("v1", at(30)));
        let message = &cache.messages(&key()).expect("seq")[0];
        assert_eq!(message.content, "v2");
        assert!(message.is_edited);
    }

    #[test]
    fn remove_returns_owner_conversation() {
        let mut cache = ConversationCache::new(0);
        cache.upsert(&key(), msg("a", 10));
        let (owner, removed) = cache.remove(&MessageId::from("a")).expect("removed");
        assert_eq!(owner, key());
        assert_eq!(removed.id.as_str(), "a");
        assert!(cache.remove(&MessageId::from("a")).is_none());
        assert!(cache.is_empty_for(&key()));
    }

    #[test]
    fn matches_pending_echo_within_window_only() {
        let mut cache = ConversationCache::new(0);
        let mut temp = msg("temp-1-abc", 10);
        temp.sender_id = UserId::from("teacher-1");
        temp.content = "hello".into();
        temp.status = MessageStatus::Sending;
        cache.upsert(&key(), temp);

        let window = chrono::Duration::seconds(5);
        let me = UserId::from("teacher-1");
        assert_eq!(
            cache.find_pending_echo(&key(), &me, "hello", at(13), window),
            Some(MessageId::from("temp-1-abc"))
        );
        assert_eq!(
            cache.find_pending_echo(&key(), &me, "hello", at(16), window),
            None
        );
        assert_eq!(
            cache.find_pending_echo(&key(), &me, "bye", at(10), window),
            None
        );
        assert_eq!(
            cache.find_temp_by_client_id(&key(), "temp-1-abc"),
            Some(MessageId::from("temp-1-abc"))
        );
    }

    #[test]
    fn evicts_least_recent_unpinned_conversation() {
        let mut cache = ConversationCache::new(2);
        let one = ConversationKey("direct:one".into());
        let two = ConversationKey("direct:two".into());
        let three = ConversationKey("direct:three".into());

        cache.upsert(&one, msg("a", 1));
        cache.pin(Some(one.clone()));
        cache.upsert(&two, msg("b", 2));
        cache.upsert(&three, msg("c", 3));

        let snapshot = cache.snapshot();
        assert!(snapshot.conversations.contains_key(&one));
        assert!(!snapshot.conversations.contains_key(&two));
        assert!(snapshot.conversations.contains_key(&three));
    }
}
