use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        ConversationIdentity, ConversationKey, ConversationState, Message, MessageId,
        TypingEntry, UserId,
    },
    protocol::{HubRequest, MessageDto, MessageDeletion, ReactionChange, ServerEvent},
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch, Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod cache;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod presence;
pub mod rest;
pub mod retry;
pub mod sender;
pub mod session;
pub mod state;
pub mod transport;
pub mod typing;

use cache::{CacheSnapshot, PageCursor};
use config::ClientSettings;
use connection::ConnectionState;
use dispatcher::{Dispatched, EventDispatcher, TypingTimer};
use error::{ConnectionError, RestError, SendFailure, SyncError, ValidationError};
use notify::{LogNotifier, Notification, Notifier};
use rest::{HttpRestApi, RestApi};
use sender::{Outbound, OutboundBody};
use state::SyncState;
use transport::{invoke_as, PushChannel, TransportEvent, WebSocketPushChannel};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    CacheUpdated { version: u64 },
    ConversationsUpdated,
    TypingChanged,
    PresenceChanged,
    MessageFailed { temp_id: MessageId, reason: String },
    Notification(Notification),
    Error(String),
}

/// UI-facing surface of the sync engine.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn start(&self) -> Result<(), SyncError>;
    async fn shutdown(&self);
    async fn reconnect(&self) -> Result<(), SyncError>;
    async fn join_conversation(&self, identity: ConversationIdentity) -> Result<(), SyncError>;
    async fn leave_conversation(&self);
    async fn send_message(
        &self,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message, SyncError>;
    async fn retry_message(&self, temp_id: &MessageId) -> Result<Message, SyncError>;
    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), SyncError>;
    async fn delete_message(&self, id: &MessageId) -> Result<(), SyncError>;
    async fn add_reaction(&self, id: &MessageId, emoji: &str) -> Result<(), SyncError>;
    async fn remove_reaction(&self, id: &MessageId, emoji: &str) -> Result<(), SyncError>;
    async fn start_typing(&self);
    async fn stop_typing(&self);
    async fn load_older_messages(&self) -> Result<usize, SyncError>;
    async fn search_messages(&self, query: &str) -> Result<Vec<Message>, SyncError>;
    async fn set_focused(&self, focused: bool) -> Result<(), SyncError>;
    async fn conversations(&self) -> Vec<ConversationState>;
    async fn active_conversation_messages(&self) -> Vec<Message>;
    async fn typing_users(&self) -> Vec<TypingEntry>;
    async fn online_users(&self) -> Vec<UserId>;
    async fn unread_count(&self) -> u32;
    fn connection_state(&self) -> ConnectionState;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    fn watch_cache(&self) -> watch::Receiver<CacheSnapshot>;
}

pub struct SyncClient {
    me: UserId,
    page_size: u32,
    push: Arc<dyn PushChannel>,
    rest: Arc<dyn RestApi>,
    notifier: Arc<dyn Notifier>,
    dispatcher: EventDispatcher,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<ClientEvent>,
    cache_tx: watch::Sender<CacheSnapshot>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(settings: ClientSettings) -> Result<Arc<Self>, ConnectionError> {
        let push = Arc::new(WebSocketPushChannel::new(&settings)?);
        let rest = Arc::new(HttpRestApi::new(
            settings.server_url.clone(),
            settings.user_id.clone(),
        ));
        Ok(Self::new_with_dependencies(
            settings,
            push,
            rest,
            Arc::new(LogNotifier),
        ))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        push: Arc<dyn PushChannel>,
        rest: Arc<dyn RestApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let me = UserId::from(settings.user_id.as_str());
        let (events, _) = broadcast::channel(1024);
        let (cache_tx, _) = watch::channel(CacheSnapshot::default());
        Arc::new(Self {
            page_size: settings.page_size(),
            dispatcher: EventDispatcher::new(&settings),
            inner: Mutex::new(SyncState::new(me.clone(), &settings)),
            me,
            push,
            rest,
            notifier,
            events,
            cache_tx,
            pump: Mutex::new(None),
        })
    }

    /// Feed one push event through the dispatcher and carry out its side
    /// effects. The event pump calls this for every server event.
    pub async fn apply_server_event(self: &Arc<Self>, event: ServerEvent) {
        debug!(event = event.name(), "sync: applying event");
        let dispatched = {
            let mut state = self.inner.lock().await;
            let since = state.cache.version();
            let dispatched = self.dispatcher.apply(&mut state, event);
            self.publish_cache(&state, since);
            dispatched
        };
        self.after_dispatch(dispatched);
    }

    fn after_dispatch(self: &Arc<Self>, dispatched: Dispatched) {
        let Dispatched {
            conversations_changed,
            typing_changed,
            presence_changed,
            typing_timer,
            notification,
            read_receipts,
        } = dispatched;

        if conversations_changed {
            let _ = self.events.send(ClientEvent::ConversationsUpdated);
        }
        if typing_changed {
            let _ = self.events.send(ClientEvent::TypingChanged);
        }
        if presence_changed {
            let _ = self.events.send(ClientEvent::PresenceChanged);
        }
        if let Some(timer) = typing_timer {
            self.schedule_typing_expiry(timer);
        }
        if let Some(notification) = notification {
            self.notifier.notify(&notification);
            let _ = self.events.send(ClientEvent::Notification(notification));
        }
        if !read_receipts.is_empty() {
            let rest = Arc::clone(&self.rest);
            tokio::spawn(async move {
                if let Err(err) = rest.mark_read(&read_receipts).await {
                    warn!(error = %err, count = read_receipts.len(), "sync: read receipt not sent");
                }
            });
        }
    }

    fn schedule_typing_expiry(self: &Arc<Self>, timer: TypingTimer) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timer.ttl).await;
            let expired = client.inner.lock().await.typing.expire(
                &timer.conversation,
                &timer.user,
                timer.generation,
            );
            if expired {
                let _ = client.events.send(ClientEvent::TypingChanged);
            }
        });
    }

    fn publish_cache(&self, state: &SyncState, since: u64) {
        let version = state.cache.version();
        if version == since {
            return;
        }
        self.cache_tx.send_replace(state.cache.snapshot());
        let _ = self.events.send(ClientEvent::CacheUpdated { version });
    }

    async fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut rx = self.push.subscribe();
        let client = Arc::clone(self);
        *pump = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => client.on_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: push events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                info!(?state, "sync: connection state changed");
                let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
            }
            TransportEvent::Connected { resumed: true } => self.resync_after_reconnect().await,
            // Explicit connects are followed up by `connect_and_sync`.
            TransportEvent::Connected { resumed: false } => {}
            TransportEvent::Server(event) => self.apply_server_event(event).await,
        }
    }

    async fn connect_and_sync(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.push.state().is_connected() {
            return Ok(());
        }
        if let Err(err) = self.push.connect().await {
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
            return Err(err.into());
        }
        self.initial_sync().await;
        self.rejoin_active().await;
        Ok(())
    }

    /// First-connect load of the conversation list and unread total. Runs
    /// once per session; later connects only refresh presence.
    async fn initial_sync(&self) {
        if !self.inner.lock().await.initial_load_done {
            let mut listed = false;
            match self.rest.list_conversations().await {
                Ok(summaries) => {
                    let mut state = self.inner.lock().await;
                    for summary in summaries {
                        let last_message = summary
                            .last_message
                            .as_ref()
                            .and_then(|dto| dto.to_message(&self.me));
                        state.conversations.upsert_summary(
                            &summary.identity,
                            summary.title,
                            last_message,
                            summary.last_activity,
                            summary.unread_count,
                        );
                    }
                    state.initial_load_done = true;
                    listed = true;
                    let _ = self.events.send(ClientEvent::ConversationsUpdated);
                }
                Err(err) => {
                    warn!(error = %err, "sync: conversation list unavailable");
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                }
            }
            // With summaries loaded the total is their sum; the server total
            // only stands in when the list could not be fetched.
            if !listed {
                match self.rest.unread_count().await {
                    Ok(unread) => {
                        self.inner
                            .lock()
                            .await
                            .conversations
                            .set_unread_total(unread.total);
                        let _ = self.events.send(ClientEvent::ConversationsUpdated);
                    }
                    Err(err) => warn!(error = %err, "sync: unread count unavailable"),
                }
            }
        }
        self.refresh_online_users().await;
    }

    /// After a dropped connection comes back: re-enter the active
    /// conversation's hub group and refresh presence. Cached messages are
    /// left alone; the push stream keeps them current.
    async fn resync_after_reconnect(&self) {
        self.rejoin_active().await;
        self.refresh_online_users().await;
    }

    /// A fresh hub connection starts outside every conversation group.
    async fn rejoin_active(&self) {
        let active = self.inner.lock().await.session.active().cloned();
        if let Some(conversation) = active {
            if let Err(err) = self
                .push
                .invoke(HubRequest::JoinConversation { conversation })
                .await
            {
                warn!(error = %err, "sync: rejoin after reconnect failed");
            }
        }
    }

    async fn refresh_online_users(&self) {
        match invoke_as::<Vec<UserId>>(self.push.as_ref(), HubRequest::GetOnlineUsers).await {
            Ok(users) => {
                let changed = self.inner.lock().await.online.replace_all(users);
                if changed {
                    let _ = self.events.send(ClientEvent::PresenceChanged);
                }
            }
            Err(err) => warn!(error = %err, "sync: online users unavailable"),
        }
    }

    /// Hub first, REST when the hub call fails. `Ok(None)` means the hub
    /// accepted the call but returned nothing decodable; the push stream
    /// will carry the result.
    async fn invoke_or_fallback<T, F, Fut>(
        &self,
        context: &'static str,
        request: HubRequest,
        fallback: F,
    ) -> Result<Option<T>, SyncError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, RestError>> + Send,
    {
        match self.push.invoke(request).await {
            Ok(value) => Ok(serde_json::from_value(value).ok()),
            Err(invoke) => {
                debug!(context, error = %invoke, "sync: hub call failed; using rest");
                match fallback().await {
                    Ok(value) => Ok(Some(value)),
                    Err(rest) => {
                        warn!(context, hub = %invoke, rest = %rest, "sync: both paths failed");
                        Err(SyncError::Unavailable {
                            context,
                            invoke,
                            rest,
                        })
                    }
                }
            }
        }
    }

    async fn stage_and_deliver(self: &Arc<Self>, outbound: Outbound) -> Result<Message, SyncError> {
        {
            let mut state = self.inner.lock().await;
            let since = state.cache.version();
            sender::stage(&mut state, &outbound);
            self.publish_cache(&state, since);
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        self.deliver(outbound).await
    }

    async fn deliver(&self, outbound: Outbound) -> Result<Message, SyncError> {
        let temp_id = outbound.temp.id.clone();
        let confirmed = match self.push.invoke(outbound.hub_request()).await {
            Ok(value) => match serde_json::from_value::<MessageDto>(value) {
                Ok(dto) => Ok(dto),
                Err(err) => {
                    // Accepted without a usable body: the push echo carries the
                    // client message id and reconciles the temp message.
                    debug!(temp_id = %temp_id, error = %err, "send: hub ack without message");
                    return Ok(outbound.temp);
                }
            },
            Err(invoke) => {
                warn!(
                    temp_id = %temp_id,
                    error = %invoke,
                    "send: hub failed; falling back to rest"
                );
                let rest = match outbound.body() {
                    OutboundBody::Direct(body) => self.rest.send_direct_message(&body).await,
                    OutboundBody::Group(body) => self.rest.send_group_message(&body).await,
                };
                rest.map_err(|rest| SendFailure {
                    temp_id: temp_id.clone(),
                    invoke,
                    rest,
                })
            }
        };

        let mut state = self.inner.lock().await;
        let since = state.cache.version();
        match confirmed {
            Ok(dto) => {
                let message = sender::confirmed_message(&outbound, &dto, &self.me);
                sender::reconcile(&mut state, &outbound, message.clone());
                self.publish_cache(&state, since);
                drop(state);
                let _ = self.events.send(ClientEvent::ConversationsUpdated);
                Ok(message)
            }
            Err(failure) => {
                warn!(error = %failure, "send: message failed");
                sender::mark_failed(&mut state, &temp_id);
                self.publish_cache(&state, since);
                drop(state);
                let _ = self.events.send(ClientEvent::MessageFailed {
                    temp_id,
                    reason: failure.to_string(),
                });
                Err(failure.into())
            }
        }
    }

    /// Load page 1 for a conversation that has never been loaded. Messages
    /// pushed or sent while the request was in flight are kept.
    async fn load_first_page(&self, identity: &ConversationIdentity) -> Result<(), SyncError> {
        let page = self
            .rest
            .list_messages(identity, 1, self.page_size)
            .await?;
        let mut messages: Vec<Message> = page
            .messages
            .iter()
            .filter_map(|dto| dto.to_message(&self.me))
            .collect();

        let key = identity.key();
        let mut state = self.inner.lock().await;
        let since = state.cache.version();
        if let Some(current) = state.cache.messages(&key) {
            let carried: Vec<Message> = current
                .iter()
                .filter(|cached| !messages.iter().any(|fetched| fetched.id == cached.id))
                .cloned()
                .collect();
            messages.extend(carried);
        }
        state.cache.replace(&key, messages);

        let loaded = state.cache.messages(&key).unwrap_or_default();
        let oldest = loaded.first().map(|message| message.id.clone());
        if let Some(newest) = loaded.last() {
            state.conversations.record_message(identity, newest, false);
        }
        state.cache.set_cursor(
            &key,
            PageCursor {
                next_page: 2,
                has_more_older: page.has_more,
                oldest_loaded_message_id: oldest.clone(),
            },
        );
        state.conversations.set_page_info(&key, page.has_more, oldest);
        self.publish_cache(&state, since);
        debug!(conversation = %key, count = loaded.len(), "sync: first page loaded");
        Ok(())
    }

    /// Mark every unread inbound message of `key` read, locally first and
    /// then with one REST batch.
    async fn mark_conversation_read(&self, key: &ConversationKey) -> Result<u32, SyncError> {
        let ids = {
            let mut state = self.inner.lock().await;
            let ids = session::unread_inbound_ids(&state.cache, key);
            if ids.is_empty() {
                return Ok(0);
            }
            let since = state.cache.version();
            let SyncState {
                cache,
                conversations,
                ..
            } = &mut *state;
            session::apply_read(cache, conversations, &ids, Utc::now());
            self.publish_cache(&state, since);
            ids
        };
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        self.rest.mark_read(&ids).await?;
        Ok(ids.len() as u32)
    }

    async fn active_identity(&self) -> Result<ConversationIdentity, SyncError> {
        self.inner
            .lock()
            .await
            .session
            .active()
            .cloned()
            .ok_or_else(|| ValidationError::NoActiveConversation.into())
    }

    async fn apply_deletion(self: &Arc<Self>, deletion: MessageDeletion) {
        self.apply_server_event(ServerEvent::MessageDeleted(deletion))
            .await;
    }

    async fn apply_reactions(self: &Arc<Self>, change: ReactionChange) {
        self.apply_server_event(ServerEvent::ReactionAdded(change))
            .await;
    }

    async fn invoke_typing(&self, request: HubRequest) {
        if !self.push.state().is_connected() {
            return;
        }
        let method = request.method();
        if let Err(err) = self.push.invoke(request).await {
            debug!(method, error = %err, "sync: typing signal dropped");
        }
    }
}

#[async_trait]
impl ChatHandle for Arc<SyncClient> {
    async fn start(&self) -> Result<(), SyncError> {
        self.ensure_pump().await;
        self.connect_and_sync().await
    }

    async fn shutdown(&self) {
        self.push.disconnect().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }

    async fn reconnect(&self) -> Result<(), SyncError> {
        self.ensure_pump().await;
        self.connect_and_sync().await
    }

    async fn join_conversation(&self, identity: ConversationIdentity) -> Result<(), SyncError> {
        let key = identity.key();
        let previous = {
            let mut state = self.inner.lock().await;
            let previous = state.session.begin_join(identity.clone());
            state.cache.pin(Some(key.clone()));
            state.conversations.ensure(&identity, Utc::now());
            previous
        };
        info!(conversation = %key, "sync: joining conversation");

        if let Some(conversation) = previous {
            if let Err(err) = self
                .push
                .invoke(HubRequest::LeaveConversation { conversation })
                .await
            {
                debug!(error = %err, "sync: leave of previous conversation failed");
            }
        }
        if let Err(err) = self
            .push
            .invoke(HubRequest::JoinConversation {
                conversation: identity.clone(),
            })
            .await
        {
            warn!(conversation = %key, error = %err, "sync: hub join failed; live updates paused");
        }

        let needs_first_page = {
            let state = self.inner.lock().await;
            state.cache.is_empty_for(&key) || state.cache.cursor(&key).next_page == 1
        };
        let loaded = if needs_first_page {
            self.load_first_page(&identity).await
        } else {
            Ok(())
        };

        let reads_live = {
            let mut state = self.inner.lock().await;
            state.session.complete_join(&identity) && state.session.reads_live(&key)
        };
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        loaded?;
        if reads_live {
            self.mark_conversation_read(&key).await?;
        }
        Ok(())
    }

    async fn leave_conversation(&self) {
        let left = {
            let mut state = self.inner.lock().await;
            state.cache.pin(None);
            state.session.leave()
        };
        if let Some(conversation) = left {
            info!(conversation = %conversation, "sync: leaving conversation");
            if let Err(err) = self
                .push
                .invoke(HubRequest::LeaveConversation { conversation })
                .await
            {
                debug!(error = %err, "sync: hub leave failed");
            }
        }
    }

    async fn send_message(
        &self,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message, SyncError> {
        let identity = self.active_identity().await?;
        let outbound =
            Outbound::compose(&self.me, identity, content, parent_message_id, Utc::now())?;
        self.stage_and_deliver(outbound).await
    }

    async fn retry_message(&self, temp_id: &MessageId) -> Result<Message, SyncError> {
        let (identity, failed) = {
            let mut state = self.inner.lock().await;
            let since = state.cache.version();
            let taken = sender::take_failed(&mut state, temp_id)?;
            self.publish_cache(&state, since);
            taken
        };
        info!(temp_id = %temp_id, "send: retrying failed message");
        let outbound = Outbound::compose(
            &self.me,
            identity,
            &failed.content,
            failed.parent_message_id,
            Utc::now(),
        )?;
        self.stage_and_deliver(outbound).await
    }

    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), SyncError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let request = HubRequest::EditMessage {
            message_id: id.clone(),
            content: content.to_string(),
        };
        let edited: Option<MessageDto> = self
            .invoke_or_fallback("edit message", request, || {
                self.rest.edit_message(id, content)
            })
            .await?;
        if let Some(dto) = edited {
            let edited_at = dto.edited_at.unwrap_or_else(Utc::now);
            self.apply_server_event(ServerEvent::MessageEdited {
                message_id: dto.id,
                content: dto.content,
                edited_at,
            })
            .await;
        }
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), SyncError> {
        let request = HubRequest::DeleteMessage {
            message_id: id.clone(),
        };
        let deleted: Option<MessageDeletion> = self
            .invoke_or_fallback("delete message", request, || self.rest.delete_message(id))
            .await?;
        if let Some(deletion) = deleted {
            self.apply_deletion(deletion).await;
        }
        Ok(())
    }

    async fn add_reaction(&self, id: &MessageId, emoji: &str) -> Result<(), SyncError> {
        if emoji.trim().is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }
        let request = HubRequest::AddReaction {
            message_id: id.clone(),
            emoji: emoji.to_string(),
        };
        let change: Option<ReactionChange> = self
            .invoke_or_fallback("add reaction", request, || {
                self.rest.add_reaction(id, emoji)
            })
            .await?;
        if let Some(change) = change {
            self.apply_reactions(change).await;
        }
        Ok(())
    }

    async fn remove_reaction(&self, id: &MessageId, emoji: &str) -> Result<(), SyncError> {
        if emoji.trim().is_empty() {
            return Err(ValidationError::EmptyEmoji.into());
        }
        let request = HubRequest::RemoveReaction {
            message_id: id.clone(),
            emoji: emoji.to_string(),
        };
        let change: Option<ReactionChange> = self
            .invoke_or_fallback("remove reaction", request, || {
                self.rest.remove_reaction(id, emoji)
            })
            .await?;
        if let Some(change) = change {
            self.apply_reactions(change).await;
        }
        Ok(())
    }

    async fn start_typing(&self) {
        let active = self.inner.lock().await.session.active().cloned();
        if let Some(conversation) = active {
            self.invoke_typing(HubRequest::StartTyping { conversation })
                .await;
        }
    }

    async fn stop_typing(&self) {
        let active = self.inner.lock().await.session.active().cloned();
        if let Some(conversation) = active {
            self.invoke_typing(HubRequest::StopTyping { conversation })
                .await;
        }
    }

    async fn load_older_messages(&self) -> Result<usize, SyncError> {
        let identity = self.active_identity().await?;
        let key = identity.key();
        let cursor = self.inner.lock().await.cache.cursor(&key);
        if !cursor.has_more_older {
            return Ok(0);
        }

        let page = self
            .rest
            .list_messages(&identity, cursor.next_page, self.page_size)
            .await?;
        let messages: Vec<Message> = page
            .messages
            .iter()
            .filter_map(|dto| dto.to_message(&self.me))
            .collect();

        let mut state = self.inner.lock().await;
        let since = state.cache.version();
        let added = state.cache.merge(&key, messages);
        let oldest = state
            .cache
            .messages(&key)
            .and_then(|seq| seq.first().map(|message| message.id.clone()));
        state.cache.set_cursor(
            &key,
            PageCursor {
                next_page: cursor.next_page + 1,
                has_more_older: page.has_more,
                oldest_loaded_message_id: oldest.clone(),
            },
        );
        state.conversations.set_page_info(&key, page.has_more, oldest);
        self.publish_cache(&state, since);
        debug!(conversation = %key, page = cursor.next_page, added, "sync: older page merged");
        Ok(added)
    }

    async fn search_messages(&self, query: &str) -> Result<Vec<Message>, SyncError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let found = self.rest.search_messages(query).await?;
        Ok(found
            .iter()
            .filter_map(|dto| dto.to_message(&self.me))
            .collect())
    }

    async fn set_focused(&self, focused: bool) -> Result<(), SyncError> {
        let newly_reading = {
            let mut state = self.inner.lock().await;
            let changed = state.session.set_focused(focused);
            let active = state.session.active_key();
            active.filter(|key| changed && state.session.reads_live(key))
        };
        if let Some(key) = newly_reading {
            self.mark_conversation_read(&key).await?;
        }
        Ok(())
    }

    async fn conversations(&self) -> Vec<ConversationState> {
        self.inner.lock().await.conversations()
    }

    async fn active_conversation_messages(&self) -> Vec<Message> {
        self.inner.lock().await.active_conversation_messages()
    }

    async fn typing_users(&self) -> Vec<TypingEntry> {
        self.inner.lock().await.typing_users()
    }

    async fn online_users(&self) -> Vec<UserId> {
        self.inner.lock().await.online_users()
    }

    async fn unread_count(&self) -> u32 {
        self.inner.lock().await.unread_count()
    }

    fn connection_state(&self) -> ConnectionState {
        self.push.state()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn watch_cache(&self) -> watch::Receiver<CacheSnapshot> {
        self.cache_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
