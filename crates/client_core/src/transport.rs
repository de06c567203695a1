//! Push channel to the realtime hub.
//!
//! One WebSocket carries JSON `HubFrame`s both ways. Invocations are
//! correlated with their completions by `invocation_id`; everything else the
//! server sends is a typed `ServerEvent` fanned out over a broadcast channel.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{HubFrame, HubRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    connection::{ConnectionState, ConnectionStateMachine, InvalidTransition},
    error::{ConnectionError, InvokeError},
    retry::BackoffPolicy,
};

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A connection is up. `resumed` is true when it replaced one that
    /// dropped, false for an explicit `connect`.
    Connected { resumed: bool },
    Server(ServerEvent),
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectionError>;
    async fn disconnect(&self);
    async fn invoke(&self, request: HubRequest) -> Result<Value, InvokeError>;
    fn state(&self) -> ConnectionState;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Invoke and decode the completion payload as `T`.
pub async fn invoke_as<T: DeserializeOwned>(
    channel: &dyn PushChannel,
    request: HubRequest,
) -> Result<T, InvokeError> {
    let method = request.method();
    let value = channel.invoke(request).await?;
    serde_json::from_value(value).map_err(|err| InvokeError::Malformed {
        method,
        reason: err.to_string(),
    })
}

/// Run `attempt` until it succeeds or `policy` runs out of attempts.
///
/// With `delay_first` every attempt waits its backoff delay first; otherwise
/// the first attempt runs immediately and only retries wait.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    delay_first: bool,
    mut attempt: F,
) -> Result<T, ConnectionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let mut tried = 0;
    while policy.allows(tried) {
        let wait = if delay_first {
            Some(policy.delay_for_attempt(tried))
        } else {
            tried.checked_sub(1).map(|n| policy.delay_for_attempt(n))
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        match attempt(tried).await {
            Ok(value) => return Ok(value),
            Err(err) => warn!(attempt = tried + 1, error = %err, "hub: connect attempt failed"),
        }
        tried += 1;
    }
    Err(ConnectionError::RetryBudgetExhausted { attempts: tried })
}

struct Completion {
    result: Option<Value>,
    error: Option<ApiError>,
}

struct HubShared {
    url: String,
    invoke_timeout: Duration,
    initial_connect: BackoffPolicy,
    reconnect: BackoffPolicy,
    machine: Mutex<ConnectionStateMachine>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_invocation_id: AtomicU64,
    epoch: AtomicU64,
    closing: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

/// `PushChannel` over tokio-tungstenite.
pub struct WebSocketPushChannel {
    shared: Arc<HubShared>,
}

impl WebSocketPushChannel {
    pub fn new(settings: &ClientSettings) -> Result<Self, ConnectionError> {
        let hub_url = settings.hub_url()?;
        let mut url = Url::parse(&hub_url).map_err(|_| ConnectionError::InvalidUrl(hub_url))?;
        url.query_pairs_mut()
            .append_pair("user_id", &settings.user_id);

        let (events, _) = broadcast::channel(1024);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            shared: Arc::new(HubShared {
                url: url.to_string(),
                invoke_timeout: settings.invoke_timeout(),
                initial_connect: settings.initial_connect,
                reconnect: settings.reconnect,
                machine: Mutex::new(ConnectionStateMachine::default()),
                state,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_invocation_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                events,
            }),
        })
    }
}

#[async_trait]
impl PushChannel for WebSocketPushChannel {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        if shared.transition(|m| m.begin_connect()).await.is_none() {
            return match self.state() {
                ConnectionState::Connected => Ok(()),
                _ => Err(ConnectionError::InProgress),
            };
        }
        shared.closing.store(false, Ordering::SeqCst);
        info!(url = %shared.url, "hub: connecting");

        let dialed = retry_with_backoff(&shared.initial_connect, false, |_| shared.dial()).await;
        match dialed {
            Ok(stream) => {
                shared.install(stream).await;
                shared.transition(|m| m.on_connected()).await;
                let _ = shared
                    .events
                    .send(TransportEvent::Connected { resumed: false });
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "hub: giving up initial connect");
                shared.transition(|m| m.on_gave_up()).await;
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(outbound) = shared.outbound.lock().await.take() {
            let _ = outbound.send(Message::Close(None));
        }
        for task in shared.tasks.lock().await.drain(..) {
            task.abort();
        }
        shared.fail_pending().await;

        let next = shared.machine.lock().await.on_disconnect();
        shared.publish(next);
        info!("hub: disconnected");
    }

    async fn invoke(&self, request: HubRequest) -> Result<Value, InvokeError> {
        let shared = &self.shared;
        let method = request.method();
        if !self.state().is_connected() {
            return Err(InvokeError::NotConnected);
        }
        let outbound = shared
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(InvokeError::NotConnected)?;

        let invocation_id = shared
            .next_invocation_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let frame = HubFrame::Invocation {
            invocation_id: invocation_id.clone(),
            request,
        };
        let text = serde_json::to_string(&frame).map_err(|err| InvokeError::Write {
            method,
            reason: err.to_string(),
        })?;

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(invocation_id.clone(), tx);
        if outbound.send(Message::Text(text)).is_err() {
            shared.pending.lock().await.remove(&invocation_id);
            return Err(InvokeError::Closed { method });
        }
        debug!(method, invocation_id = %invocation_id, "hub: invoke");

        match tokio::time::timeout(shared.invoke_timeout, rx).await {
            Err(_) => {
                shared.pending.lock().await.remove(&invocation_id);
                Err(InvokeError::Timeout {
                    method,
                    timeout_ms: shared.invoke_timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => Err(InvokeError::Closed { method }),
            Ok(Ok(Completion {
                error: Some(error), ..
            })) => Err(InvokeError::Server { method, error }),
            Ok(Ok(Completion { result, .. })) => Ok(result.unwrap_or(Value::Null)),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl HubShared {
    fn publish(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            let _ = self.events.send(TransportEvent::StateChanged(next));
        }
    }

    async fn transition(
        &self,
        step: impl FnOnce(
            &mut ConnectionStateMachine,
        ) -> Result<ConnectionState, InvalidTransition>,
    ) -> Option<ConnectionState> {
        let mut machine = self.machine.lock().await;
        match step(&mut machine) {
            Ok(next) => {
                self.publish(next);
                Some(next)
            }
            Err(err) => {
                debug!(error = %err, "hub: transition skipped");
                None
            }
        }
    }

    async fn dial(&self) -> Result<HubStream, ConnectionError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ConnectionError::Dial(err.to_string()))?;
        Ok(stream)
    }

    async fn install(self: &Arc<Self>, stream: HubStream) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    warn!(error = %err, "hub: send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let shared = Arc::clone(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => shared.handle_frame(&text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "hub: receive failed");
                        break;
                    }
                }
            }
            shared.on_reader_closed(epoch).await;
        });

        *self.outbound.lock().await = Some(tx);
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(writer);
        tasks.push(reader);
    }

    async fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<HubFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "hub: invalid frame");
                return;
            }
        };
        match frame {
            HubFrame::Event { event } => {
                debug!(event = event.name(), "hub: event");
                let _ = self.events.send(TransportEvent::Server(event));
            }
            HubFrame::Completion {
                invocation_id,
                result,
                error,
            } => match self.pending.lock().await.remove(&invocation_id) {
                Some(waiter) => {
                    let _ = waiter.send(Completion { result, error });
                }
                None => debug!(invocation_id = %invocation_id, "hub: completion without waiter"),
            },
            HubFrame::Invocation { request, .. } => {
                debug!(method = request.method(), "hub: ignoring server invocation");
            }
            HubFrame::Ping => {}
        }
    }

    async fn fail_pending(&self) {
        // Dropping the senders resolves every waiter with `Closed`.
        self.pending.lock().await.clear();
    }

    // Returns a boxed `Send` future (instead of `async fn`) to break the
    // install <-> reader-task recursion for the compiler's `Send` inference.
    fn on_reader_closed(
        self: Arc<Self>,
        epoch: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.closing.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            self.outbound.lock().await.take();
            self.fail_pending().await;
            if self
                .transition(|m| m.on_connection_lost())
                .await
                .is_none()
            {
                return;
            }
            warn!("hub: connection lost; reconnecting");

            let policy = self.reconnect;
            let dialed = retry_with_backoff(&policy, true, |_| self.dial()).await;
            match dialed {
                Ok(stream) => {
                    self.install(stream).await;
                    if self.transition(|m| m.on_connected()).await.is_some() {
                        info!("hub: reconnected");
                        let _ = self
                            .events
                            .send(TransportEvent::Connected { resumed: true });
                    }
                }
                Err(err) => {
                    warn!(error = %err, "hub: giving up reconnecting");
                    self.transition(|m| m.on_gave_up()).await;
                }
            }
        })
    }
}
