//! Optimistic sends: a temp message shows up immediately and is later swapped
//! for the server's confirmed copy, or marked `Failed` in place.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationIdentity, Message, MessageId, MessageStatus, UserId},
    protocol::{DirectMessageBody, GroupMessageBody, HubRequest, MessageDto},
};
use tracing::debug;

use crate::{
    cache::{MessagePatch, PatchOutcome, UpsertOutcome},
    error::ValidationError,
    state::SyncState,
};

/// One outbound message, addressed both ways so either delivery path can
/// carry it.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub identity: ConversationIdentity,
    pub temp: Message,
}

impl Outbound {
    pub fn compose(
        me: &UserId,
        identity: ConversationIdentity,
        content: &str,
        parent_message_id: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let id = MessageId::temp(now);
        let temp = Message {
            client_message_id: Some(id.0.clone()),
            id,
            conversation_id: identity.key(),
            sender_id: me.clone(),
            sender_name: None,
            content: content.to_string(),
            sent_at: now,
            status: MessageStatus::Sending,
            is_own_message: true,
            parent_message_id,
            reactions: None,
            is_edited: false,
            is_deleted: false,
            edited_at: None,
            deleted_at: None,
            read_at: None,
            delivered_at: None,
        };
        Ok(Self { identity, temp })
    }

    /// The wire body. Its `client_message_id` is the temp id, which lets the
    /// push echo be matched back to the pending message.
    pub fn body(&self) -> OutboundBody {
        let content = self.temp.content.clone();
        let parent_message_id = self.temp.parent_message_id.clone();
        let client_message_id = Some(self.temp.id.0.clone());
        match &self.identity {
            ConversationIdentity::Direct { other_user_id } => {
                OutboundBody::Direct(DirectMessageBody {
                    recipient_id: other_user_id.clone(),
                    content,
                    parent_message_id,
                    client_message_id,
                })
            }
            ConversationIdentity::Group {
                group_id,
                group_type,
            } => OutboundBody::Group(GroupMessageBody {
                group_id: group_id.clone(),
                group_type: group_type.clone(),
                content,
                parent_message_id,
                client_message_id,
            }),
        }
    }

    pub fn hub_request(&self) -> HubRequest {
        match self.body() {
            OutboundBody::Direct(body) => HubRequest::SendDirectMessage(body),
            OutboundBody::Group(body) => HubRequest::SendGroupMessage(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundBody {
    Direct(DirectMessageBody),
    Group(GroupMessageBody),
}

/// Put the temp message into the cache and the conversation preview.
pub fn stage(state: &mut SyncState, outbound: &Outbound) {
    let key = outbound.identity.key();
    if state.cache.upsert(&key, outbound.temp.clone()) == UpsertOutcome::Inserted {
        state
            .conversations
            .record_message(&outbound.identity, &outbound.temp, false);
    }
}

/// Swap the temp message for the confirmed one. Safe to call after the push
/// echo already did the swap.
pub fn reconcile(state: &mut SyncState, outbound: &Outbound, confirmed: Message) {
    let key = outbound.identity.key();
    let temp_id = &outbound.temp.id;
    let removed = state.cache.remove(temp_id).is_some();
    let outcome = state.cache.upsert(&key, confirmed.clone());
    debug!(temp_id = %temp_id, message_id = %confirmed.id, removed, ?outcome, "send: reconciled");
    if outcome == UpsertOutcome::Inserted && !removed {
        state
            .conversations
            .record_message(&outbound.identity, &confirmed, false);
    } else {
        state
            .conversations
            .reconcile_last_message(&key, temp_id, &confirmed);
    }
}

/// Mark the temp message failed in place. Returns false when it is gone,
/// e.g. because the echo already replaced it.
pub fn mark_failed(state: &mut SyncState, temp_id: &MessageId) -> bool {
    match state.cache.patch(temp_id, &MessagePatch::failed()) {
        PatchOutcome::Applied {
            conversation,
            current,
            ..
        } => {
            state
                .conversations
                .refresh_last_message(&conversation, &current);
            true
        }
        PatchOutcome::Unchanged { .. } => true,
        PatchOutcome::NotFound => false,
    }
}

/// Take a failed temp message out of the cache so it can be sent again.
pub fn take_failed(
    state: &mut SyncState,
    temp_id: &MessageId,
) -> Result<(ConversationIdentity, Message), ValidationError> {
    let retryable = state.cache.find(temp_id).and_then(|(key, message)| {
        let failed = message.id.is_temp() && message.status == MessageStatus::Failed;
        let identity = state.conversations.identity(key)?.clone();
        failed.then(|| (identity, message.clone()))
    });
    let Some((identity, failed)) = retryable else {
        return Err(ValidationError::NotRetryable(temp_id.clone()));
    };
    let key = identity.key();
    state.cache.remove(temp_id);
    state.conversations.forget_message(&key, temp_id);
    Ok((identity, failed))
}

/// The server's copy of an outbound message, filed under the conversation it
/// was sent to even when the payload omits the addressing fields.
pub fn confirmed_message(outbound: &Outbound, dto: &MessageDto, me: &UserId) -> Message {
    let mut message = dto.to_message(me).unwrap_or_else(|| {
        let mut message = outbound.temp.clone();
        message.id = dto.id.clone();
        message.content = dto.content.clone();
        message.sent_at = dto.sent_at;
        message.status = dto.status.unwrap_or(MessageStatus::Delivered);
        message.sender_name = dto.sender_name.clone();
        message.reactions = dto.reactions.clone();
        message.delivered_at = dto.delivered_at;
        message.read_at = dto.read_at;
        message
    });
    message.conversation_id = outbound.identity.key();
    message.is_own_message = true;
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;

    fn state() -> SyncState {
        SyncState::new(UserId::from("teacher-1"), &ClientSettings::default())
    }

    fn confirmed(outbound: &Outbound, id: &str) -> Message {
        let mut message = outbound.temp.clone();
        message.id = MessageId::from(id);
        message.status = MessageStatus::Delivered;
        message
    }

    #[test]
    fn compose_rejects_blank_content() {
        let err = Outbound::compose(
            &UserId::from("teacher-1"),
            ConversationIdentity::direct("student-7"),
            "   ",
            None,
            Utc::now(),
        )
        .expect_err("blank");
        assert_eq!(err, ValidationError::EmptyContent);
    }

    #[test]
    fn group_send_carries_group_identity_and_client_id() {
        let outbound = Outbound::compose(
            &UserId::from("teacher-1"),
            ConversationIdentity::group("g-1", "class"),
            "homework due friday",
            None,
            Utc::now(),
        )
        .expect("outbound");
        assert!(outbound.temp.id.is_temp());
        assert_eq!(outbound.temp.status, MessageStatus::Sending);
        match outbound.hub_request() {
            HubRequest::SendGroupMessage(body) => {
                assert_eq!(body.group_id.as_str(), "g-1");
                assert_eq!(body.group_type, "class");
                assert_eq!(
                    body.client_message_id.as_deref(),
                    Some(outbound.temp.id.as_str())
                );
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn reconcile_replaces_temp_once() {
        let mut state = state();
        let outbound = Outbound::compose(
            &UserId::from("teacher-1"),
            ConversationIdentity::direct("student-7"),
            "hello",
            None,
            Utc::now(),
        )
        .expect("outbound");
        stage(&mut state, &outbound);

        reconcile(&mut state, &outbound, confirmed(&outbound, "m-42"));
        reconcile(&mut state, &outbound, confirmed(&outbound, "m-42"));

        let key = outbound.identity.key();
        let messages = state.cache.messages(&key).expect("sequence");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id.as_str(), "m-42");
        let preview = state.conversations.get(&key).expect("entry");
        assert_eq!(
            preview.last_message.as_ref().map(|m| m.id.as_str()),
            Some("m-42")
        );
        assert_eq!(preview.unread_count, 0);
    }

    #[test]
    fn only_failed_temp_messages_can_be_taken_for_retry() {
        let mut state = state();
        let outbound = Outbound::compose(
            &UserId::from("teacher-1"),
            ConversationIdentity::direct("student-7"),
            "hello",
            None,
            Utc::now(),
        )
        .expect("outbound");
        stage(&mut state, &outbound);
        let temp_id = outbound.temp.id.clone();

        let err = take_failed(&mut state, &temp_id).expect_err("still sending");
        assert_eq!(err, ValidationError::NotRetryable(temp_id.clone()));

        assert!(mark_failed(&mut state, &temp_id));
        let (identity, failed) = take_failed(&mut state, &temp_id).expect("retryable");
        assert_eq!(identity, outbound.identity);
        assert_eq!(failed.content, "hello");
        assert!(state.cache.find(&temp_id).is_none());
    }

    #[test]
    fn confirmed_message_without_addressing_lands_in_sent_conversation() {
        let outbound = Outbound::compose(
            &UserId::from("teacher-1"),
            ConversationIdentity::direct("student-7"),
            "hello",
            None,
            Utc::now(),
        )
        .expect("outbound");
        let dto = MessageDto {
            id: MessageId::from("m-42"),
            client_message_id: None,
            sender_id: UserId::from("teacher-1"),
            sender_name: None,
            recipient_id: None,
            group_id: None,
            group_type: None,
            content: "hello".into(),
            sent_at: outbound.temp.sent_at,
            status: Some(MessageStatus::Delivered),
            parent_message_id: None,
            reactions: None,
            is_edited: false,
            is_deleted: false,
            edited_at: None,
            deleted_at: None,
            read_at: None,
            delivered_at: None,
        };
        let message = confirmed_message(&outbound, &dto, &UserId::from("teacher-1"));
        assert_eq!(message.id.as_str(), "m-42");
        assert_eq!(message.conversation_id, outbound.identity.key());
        assert_eq!(message.status, MessageStatus::Delivered);
    }
}
