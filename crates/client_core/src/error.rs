use shared::{domain::MessageId, error::ApiError};
use thiserror::Error;

/// Failure to establish or keep the hub connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid hub url '{0}'")]
    InvalidUrl(String),
    #[error("failed to connect hub: {0}")]
    Dial(String),
    #[error("hub connection is not established")]
    NotConnected,
    #[error("a hub connection attempt is already in progress")]
    InProgress,
    #[error("gave up connecting after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },
}

/// Failure of a single hub invocation. Callers recover through REST.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvokeError {
    #[error("hub connection is not established")]
    NotConnected,
    #[error("hub connection closed before '{method}' completed")]
    Closed { method: &'static str },
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: &'static str,
        timeout_ms: u64,
    },
    #[error("server rejected '{method}': {error}")]
    Server {
        method: &'static str,
        error: ApiError,
    },
    #[error("malformed response for '{method}': {reason}")]
    Malformed {
        method: &'static str,
        reason: String,
    },
    #[error("failed to write '{method}' to hub: {reason}")]
    Write {
        method: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {error}")]
    Status { status: u16, error: ApiError },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RestError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { error, .. } if error.is_not_found())
    }
}

/// Both delivery paths failed for one outbound message. The message stays in
/// the cache marked `Failed`.
#[derive(Debug, Error)]
#[error("message {temp_id} was not sent: hub: {invoke}; rest: {rest}")]
pub struct SendFailure {
    pub temp_id: MessageId,
    pub invoke: InvokeError,
    pub rest: RestError,
}

/// Input rejected before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("emoji must not be empty")]
    EmptyEmoji,
    #[error("message {0} is not a failed outbound message")]
    NotRetryable(MessageId),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Send(#[from] SendFailure),
    #[error("{context}: hub: {invoke}; rest: {rest}")]
    Unavailable {
        context: &'static str,
        invoke: InvokeError,
        rest: RestError,
    },
}
