//! Request/response API of the chat backend. Used for history, the
//! conversation list, read receipts, and as the fallback path whenever a hub
//! invocation fails.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationIdentity, MessageId},
    error::{code_for_http_status, ApiError},
    protocol::{
        ConversationSummary, DirectMessageBody, GroupMessageBody, MarkReadBody, MessageDeletion,
        MessageDto, MessagePage, ReactionChange, UnreadCount,
    },
};
use tracing::debug;

use crate::error::RestError;

#[async_trait]
pub trait RestApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError>;
    async fn unread_count(&self) -> Result<UnreadCount, RestError>;
    /// Page 1 holds the newest messages; higher pages walk back in time.
    async fn list_messages(
        &self,
        conversation: &ConversationIdentity,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, RestError>;
    async fn search_messages(&self, query: &str) -> Result<Vec<MessageDto>, RestError>;
    async fn send_direct_message(&self, body: &DirectMessageBody)
        -> Result<MessageDto, RestError>;
    async fn send_group_message(&self, body: &GroupMessageBody) -> Result<MessageDto, RestError>;
    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<MessageDto, RestError>;
    async fn delete_message(&self, id: &MessageId) -> Result<MessageDeletion, RestError>;
    async fn add_reaction(&self, id: &MessageId, emoji: &str)
        -> Result<ReactionChange, RestError>;
    async fn remove_reaction(
        &self,
        id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionChange, RestError>;
    async fn mark_read(&self, ids: &[MessageId]) -> Result<(), RestError>;
}

#[derive(Serialize)]
struct EditBody<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ReactionBody<'a> {
    emoji: &'a str,
}

pub struct HttpRestApi {
    http: Client,
    server_url: String,
    user_id: String,
}

impl HttpRestApi {
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&[("user_id", self.user_id.as_str())])
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RestError> {
        let response = checked(self.authed(request).send().await?).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Turn a non-success status into `RestError::Status`, decoding the server's
/// error body when it sent one.
async fn checked(response: Response) -> Result<Response, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let status = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(code_for_http_status(status), body));
    debug!(status, error = %error, "rest: request rejected");
    Err(RestError::Status { status, error })
}

fn conversation_query(conversation: &ConversationIdentity) -> Vec<(&'static str, String)> {
    match conversation {
        ConversationIdentity::Direct { other_user_id } => vec![
            ("kind", "direct".to_string()),
            ("other_user_id", other_user_id.to_string()),
        ],
        ConversationIdentity::Group {
            group_id,
            group_type,
        } => vec![
            ("kind", "group".to_string()),
            ("group_id", group_id.to_string()),
            ("group_type", group_type.clone()),
        ],
    }
}

#[async_trait]
impl RestApi for HttpRestApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, RestError> {
        self.fetch(self.http.get(self.url("/conversations"))).await
    }

    async fn unread_count(&self) -> Result<UnreadCount, RestError> {
        self.fetch(self.http.get(self.url("/messages/unread-count")))
            .await
    }

    async fn list_messages(
        &self,
        conversation: &ConversationIdentity,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage, RestError> {
        let mut query = conversation_query(conversation);
        query.push(("page", page.to_string()));
        query.push(("page_size", page_size.to_string()));
        self.fetch(
            self.http
                .get(self.url("/conversations/messages"))
                .query(&query),
        )
        .await
    }

    async fn search_messages(&self, query: &str) -> Result<Vec<MessageDto>, RestError> {
        self.fetch(
            self.http
                .get(self.url("/messages/search"))
                .query(&[("q", query)]),
        )
        .await
    }

    async fn send_direct_message(
        &self,
        body: &DirectMessageBody,
    ) -> Result<MessageDto, RestError> {
        self.fetch(self.http.post(self.url("/messages/direct")).json(body))
            .await
    }

    async fn send_group_message(&self, body: &GroupMessageBody) -> Result<MessageDto, RestError> {
        self.fetch(self.http.post(self.url("/messages/group")).json(body))
            .await
    }

    async fn edit_message(&self, id: &MessageId, content: &str) -> Result<MessageDto, RestError> {
        self.fetch(
            self.http
                .put(self.url(&format!("/messages/{id}")))
                .json(&EditBody { content }),
        )
        .await
    }

    async fn delete_message(&self, id: &MessageId) -> Result<MessageDeletion, RestError> {
        self.fetch(self.http.delete(self.url(&format!("/messages/{id}"))))
            .await
    }

    async fn add_reaction(
        &self,
        id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionChange, RestError> {
        self.fetch(
            self.http
                .post(self.url(&format!("/messages/{id}/reactions")))
                .json(&ReactionBody { emoji }),
        )
        .await
    }

    async fn remove_reaction(
        &self,
        id: &MessageId,
        emoji: &str,
    ) -> Result<ReactionChange, RestError> {
        self.fetch(
            self.http
                .delete(self.url(&format!("/messages/{id}/reactions")))
                .query(&[("emoji", emoji)]),
        )
        .await
    }

    async fn mark_read(&self, ids: &[MessageId]) -> Result<(), RestError> {
        let body = MarkReadBody {
            message_ids: ids.to_vec(),
        };
        let request = self.http.post(self.url("/messages/read")).json(&body);
        checked(self.authed(request).send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
