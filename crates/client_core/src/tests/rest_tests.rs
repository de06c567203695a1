use std::{collections::HashMap, sync::Arc};

use super::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use shared::error::ErrorCode;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    read_bodies: Arc<Mutex<Vec<MarkReadBody>>>,
}

fn dto(id: &str, sender: &str, recipient: &str) -> MessageDto {
    MessageDto {
        id: MessageId::from(id),
        client_message_id: None,
        sender_id: sender.into(),
        sender_name: None,
        recipient_id: Some(recipient.into()),
        group_id: None,
        group_type: None,
        content: format!("body {id}"),
        sent_at: chrono::Utc::now(),
        status: None,
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

async fn list_messages_handler(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<MessagePage> {
    state.queries.lock().await.push(query);
    Json(MessagePage {
        messages: vec![dto("m-1", "student-7", "teacher-1")],
        has_more: true,
    })
}

async fn send_direct_handler(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<DirectMessageBody>,
) -> Json<MessageDto> {
    state.queries.lock().await.push(query);
    let mut sent = dto("m-42", "teacher-1", body.recipient_id.as_str());
    sent.content = body.content;
    sent.client_message_id = body.client_message_id;
    Json(sent)
}

async fn edit_handler(Path(id): Path<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new(
            ErrorCode::NotFound,
            format!("message {id} not found"),
        )),
    )
}

async fn delete_handler() -> (StatusCode, &'static str) {
    (StatusCode::FORBIDDEN, "nope")
}

async fn unread_count_handler() -> &'static str {
    "{\"total\": \"lots\"}"
}

async fn mark_read_handler(
    State(state): State<ServerState>,
    Json(body): Json<MarkReadBody>,
) -> StatusCode {
    state.read_bodies.lock().await.push(body);
    StatusCode::NO_CONTENT
}

async fn spawn_rest_server() -> anyhow::Result<(String, ServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ServerState::default();
    let app = Router::new()
        .route("/conversations/messages", get(list_messages_handler))
        .route("/messages/direct", post(send_direct_handler))
        .route("/messages/read", post(mark_read_handler))
        .route("/messages/unread-count", get(unread_count_handler))
        .route("/messages/:id", put(edit_handler).delete(delete_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn list_messages_sends_identity_page_and_user() {
    let (server_url, state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(server_url, "teacher-1");

    let page = api
        .list_messages(&ConversationIdentity::group("g-1", "class"), 2, 25)
        .await
        .expect("page");
    assert!(page.has_more);
    assert_eq!(page.messages[0].id.as_str(), "m-1");

    let queries = state.queries.lock().await;
    let query = &queries[0];
    assert_eq!(query.get("user_id").map(String::as_str), Some("teacher-1"));
    assert_eq!(query.get("kind").map(String::as_str), Some("group"));
    assert_eq!(query.get("group_id").map(String::as_str), Some("g-1"));
    assert_eq!(query.get("group_type").map(String::as_str), Some("class"));
    assert_eq!(query.get("page").map(String::as_str), Some("2"));
    assert_eq!(query.get("page_size").map(String::as_str), Some("25"));
}

#[tokio::test]
async fn send_direct_message_posts_body_with_client_id() {
    let (server_url, _state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(format!("{server_url}/"), "teacher-1");

    let sent = api
        .send_direct_message(&DirectMessageBody {
            recipient_id: "student-7".into(),
            content: "hello".into(),
            parent_message_id: None,
            client_message_id: Some("temp-1-abc".into()),
        })
        .await
        .expect("sent");
    assert_eq!(sent.id.as_str(), "m-42");
    assert_eq!(sent.content, "hello");
    assert_eq!(sent.client_message_id.as_deref(), Some("temp-1-abc"));
}

#[tokio::test]
async fn structured_error_body_is_decoded() {
    let (server_url, _state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(server_url, "teacher-1");

    let err = api
        .edit_message(&MessageId::from("m-404"), "fixed")
        .await
        .expect_err("missing message");
    assert!(err.is_not_found());
    match err {
        RestError::Status { status, error } => {
            assert_eq!(status, 404);
            assert_eq!(error.message, "message m-404 not found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn plain_error_body_maps_status_to_code() {
    let (server_url, _state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(server_url, "teacher-1");

    let err = api
        .delete_message(&MessageId::from("m-1"))
        .await
        .expect_err("forbidden");
    match err {
        RestError::Status { status, error } => {
            assert_eq!(status, 403);
            assert_eq!(error.code, ErrorCode::Forbidden);
            assert_eq!(error.message, "nope");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn mark_read_sends_one_batch() {
    let (server_url, state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(server_url, "teacher-1");

    api.mark_read(&[MessageId::from("m-1"), MessageId::from("m-2")])
        .await
        .expect("marked");
    let bodies = state.read_bodies.lock().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(
        bodies[0].message_ids,
        vec![MessageId::from("m-1"), MessageId::from("m-2")]
    );
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let (server_url, _state) = spawn_rest_server().await.expect("spawn server");
    let api = HttpRestApi::new(server_url, "teacher-1");

    let err = api.unread_count().await.expect_err("malformed");
    assert!(matches!(err, RestError::Decode(_)), "unexpected error: {err}");
    assert!(!err.is_not_found());
}
