//! Applies server push events to `SyncState`.
//!
//! Every handler is idempotent: replaying an event leaves the state as the
//! first application did. Events naming messages that are not cached are
//! dropped quietly.

use std::time::Duration;

use chrono::Utc;
use shared::{
    domain::{ConversationKey, MessageId, TypingEntry, UserId},
    protocol::{MessageDeletion, MessageDto, ReactionChange, ServerEvent, TypingNotice},
};
use tracing::{debug, warn};

use crate::{
    cache::{MessagePatch, PatchOutcome, UpsertOutcome},
    config::{ChatSettings, ClientSettings},
    notify::Notification,
    session,
    state::SyncState,
};

/// Expiry timer the caller must arm for a typing indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingTimer {
    pub conversation: ConversationKey,
    pub user: UserId,
    pub generation: u64,
    pub ttl: Duration,
}

/// What changed, and the side effects the caller owes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Dispatched {
    pub conversations_changed: bool,
    pub typing_changed: bool,
    pub presence_changed: bool,
    pub typing_timer: Option<TypingTimer>,
    pub notification: Option<Notification>,
    /// Inbound messages that arrived in the focused active conversation and
    /// were already marked read locally; the server still has to hear of it.
    pub read_receipts: Vec<MessageId>,
}

pub struct EventDispatcher {
    echo_window: chrono::Duration,
    chat: ChatSettings,
}

impl EventDispatcher {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            echo_window: settings.echo_match_window(),
            chat: settings.chat,
        }
    }

    pub fn apply(&self, state: &mut SyncState, event: ServerEvent) -> Dispatched {
        let mut out = Dispatched::default();
        match event {
            ServerEvent::ReceiveDirectMessage { message }
            | ServerEvent::ReceiveGroupMessage { message } => {
                self.on_message(state, message, &mut out)
            }
            ServerEvent::MessageDelivered {
                message_id,
                delivered_at,
            } => {
                let outcome = state
                    .cache
                    .patch(&message_id, &MessagePatch::delivered(delivered_at));
                refresh_preview(state, outcome, &mut out);
            }
            ServerEvent::MessagesRead {
                message_ids,
                reader_id,
                read_at,
            } => {
                debug!(reader = %reader_id, count = message_ids.len(), "dispatch: read receipt");
                let version = state.cache.version();
                session::apply_read(
                    &mut state.cache,
                    &mut state.conversations,
                    &message_ids,
                    read_at,
                );
                out.conversations_changed = version != state.cache.version();
            }
            ServerEvent::MessageEdited {
                message_id,
                content,
                edited_at,
            } => {
                let outcome = state
                    .cache
                    .patch(&message_id, &MessagePatch::edited(content, edited_at));
                refresh_preview(state, outcome, &mut out);
            }
            ServerEvent::MessageDeleted(deletion) => self.on_deleted(state, deletion, &mut out),
            ServerEvent::ReactionAdded(change) | ServerEvent::ReactionRemoved(change) => {
                on_reactions(state, change, &mut out)
            }
            ServerEvent::UserTyping(notice) => on_typing(state, notice, &mut out),
            ServerEvent::UserStoppedTyping(notice) => {
                let key = notice.identity().key();
                out.typing_changed = state.typing.stop(&key, &notice.user_id);
            }
            ServerEvent::UserOnline { user_id } => {
                out.presence_changed = state.online.add(user_id);
            }
            ServerEvent::UserOffline { user_id } => {
                out.presence_changed = state.online.remove(&user_id);
            }
            ServerEvent::UsersOnline { user_ids } => {
                out.presence_changed = state.online.replace_all(user_ids);
            }
            ServerEvent::ConversationUpdated { conversation } => {
                let last_message = conversation
                    .last_message
                    .as_ref()
                    .and_then(|dto| dto.to_message(&state.me));
                state.conversations.upsert_summary(
                    &conversation.identity,
                    conversation.title,
                    last_message,
                    conversation.last_activity,
                    conversation.unread_count,
                );
                out.conversations_changed = true;
            }
            ServerEvent::UnreadCountChanged { total } => {
                out.conversations_changed = state.conversations.unread_total() != total;
                state.conversations.set_unread_total(total);
            }
        }
        out
    }

    fn on_message(&self, state: &mut SyncState, dto: MessageDto, out: &mut Dispatched) {
        let me = &state.me;
        let (Some(identity), Some(message)) = (dto.identity_for(me), dto.to_message(me)) else {
            warn!(message_id = %dto.id, "dispatch: message without a resolvable conversation");
            return;
        };
        let key = identity.key();

        if message.is_own_message && state.cache.find(&message.id).is_none() {
            let pending = dto
                .client_message_id
                .as_deref()
                .and_then(|client_id| state.cache.find_temp_by_client_id(&key, client_id))
                .or_else(|| {
                    state.cache.find_pending_echo(
                        &key,
                        &message.sender_id,
                        &message.content,
                        message.sent_at,
                        self.echo_window,
                    )
                });
            if let Some(temp_id) = pending {
                debug!(
                    temp_id = %temp_id,
                    message_id = %message.id,
                    "dispatch: echo confirms pending send"
                );
                state.cache.remove(&temp_id);
                state.cache.upsert(&key, message.clone());
                state
                    .conversations
                    .reconcile_last_message(&key, &temp_id, &message);
                out.conversations_changed = true;
                return;
            }
        }

        match state.cache.upsert(&key, message.clone()) {
            UpsertOutcome::Inserted => {
                let unread = message.is_unread_inbound();
                state.conversations.record_message(&identity, &message, unread);
                out.conversations_changed = true;
                if message.is_own_message {
                    return;
                }
                out.notification = Notification::for_inbound(&self.chat, key.clone(), &message);
                if unread && state.session.reads_live(&key) {
                    session::apply_read(
                        &mut state.cache,
                        &mut state.conversations,
                        std::slice::from_ref(&message.id),
                        Utc::now(),
                    );
                    out.read_receipts.push(message.id);
                }
            }
            UpsertOutcome::Updated => {
                if let Some(current) = state
                    .cache
                    .find(&message.id)
                    .map(|(_, current)| current.clone())
                {
                    state.conversations.refresh_last_message(&key, &current);
                    out.conversations_changed = true;
                }
            }
            UpsertOutcome::Unchanged => {}
        }
    }

    fn on_deleted(&self, state: &mut SyncState, deletion: MessageDeletion, out: &mut Dispatched) {
        if deletion.hard_delete {
            let Some((key, removed)) = state.cache.remove(&deletion.message_id) else {
                return;
            };
            if removed.is_unread_inbound() {
                state.conversations.mark_read(&key, 1);
            }
            state.conversations.forget_message(&key, &removed.id);
            out.conversations_changed = true;
            return;
        }
        let outcome = state.cache.patch(
            &deletion.message_id,
            &MessagePatch::soft_deleted(deletion.deleted_at),
        );
        refresh_preview(state, outcome, out);
    }
}

fn refresh_preview(state: &mut SyncState, outcome: PatchOutcome, out: &mut Dispatched) {
    if let PatchOutcome::Applied {
        conversation,
        current,
        ..
    } = outcome
    {
        state
            .conversations
            .refresh_last_message(&conversation, &current);
        out.conversations_changed = true;
    }
}

fn on_reactions(state: &mut SyncState, change: ReactionChange, out: &mut Dispatched) {
    let outcome = state
        .cache
        .patch(&change.message_id, &MessagePatch::reactions(change.reactions));
    refresh_preview(state, outcome, out);
}

fn on_typing(state: &mut SyncState, notice: TypingNotice, out: &mut Dispatched) {
    if notice.user_id == state.me {
        return;
    }
    let conversation = notice.identity().key();
    let entry = TypingEntry {
        conversation_id: conversation.clone(),
        user_id: notice.user_id.clone(),
        user_name: notice.user_name,
        started_at: Utc::now(),
    };
    let generation = state.typing.start(entry);
    out.typing_changed = true;
    out.typing_timer = Some(TypingTimer {
        conversation,
        user: notice.user_id,
        generation,
        ttl: state.typing.ttl(),
    });
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
