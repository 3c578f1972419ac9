//! REST surface: thin adapters over the dispatcher and the user
//! orchestrator, mapping the error taxonomy onto the wire envelope.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::dispatch::MessageDispatcher;
use crate::error::{codes, ChatError};
use crate::ids;
use crate::model::{ContentType, Envelope, Message, MsgStatus, MsgType, StringTimestamp};
use crate::registry::ConnectionRegistry;
use crate::users::UserService;

/// Client-identity cookie and header name.
pub const CLIENT_ID_KEY: &str = "cland-cid";

const COOKIE_MAX_AGE_SECS: u64 = 31_536_000;

/// Shared state for every HTTP and socket handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<MessageDispatcher>,
    pub users: Arc<UserService>,
    pub registry: Arc<ConnectionRegistry>,
    /// Root token; cancelled on shutdown to abort in-flight persistence.
    pub shutdown: CancellationToken,
}

fn envelope_response(status: StatusCode, envelope: Envelope) -> Response {
    (status, Json(envelope)).into_response()
}

fn error_response(code: i64, err: &ChatError) -> Response {
    let status = if code >= codes::SYSTEM_ERROR {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    };
    envelope_response(status, Envelope::error(code, err.to_string()))
}

/// `GET /health` — standard envelope for infra probes.
pub async fn health() -> Response {
    envelope_response(StatusCode::OK, Envelope::success(serde_json::Value::Null))
}

/// `GET /api/health`.
pub async fn api_health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// `POST /api/init` — mint or reuse the client identity and open a session.
///
/// The previous identity may arrive as the `cland-cid` cookie or header; the
/// minted identity is set back as a year-long cookie.
pub async fn init_user(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let hint = client_id_hint(&headers);

    let outcome = match state
        .users
        .init_user(&state.shutdown, hint.as_deref())
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(%err, "user init failed");
            return error_response(codes::USER_INIT_FAILED, &err);
        }
    };

    let cookie = format!(
        "{CLIENT_ID_KEY}={}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; Secure; HttpOnly",
        outcome.cland_cid
    );
    let envelope = Envelope::success(json!({
        "sessionId": outcome.session_id,
        "subSessionId": outcome.sub_session_id,
        "token": outcome.token,
    }));

    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(envelope),
    )
        .into_response()
}

fn client_id_hint(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(CLIENT_ID_KEY).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == CLIENT_ID_KEY && !value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Deserialize)]
pub struct OfflineQuery {
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
}

/// `GET /api/messages/offline?userId=<id>` — drain the offline inbox.
pub async fn get_offline_messages(
    State(state): State<AppState>,
    Query(query): Query<OfflineQuery>,
) -> Response {
    let Some(user_id) = query.user_id.filter(|id| !id.is_empty()) else {
        return envelope_response(
            StatusCode::BAD_REQUEST,
            Envelope::error(codes::PARAM_USER_ID_MISSING, "userId is required"),
        );
    };

    match state
        .dispatcher
        .get_offline_messages(&state.shutdown, &user_id)
        .await
    {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "data": {"messages": messages}})),
        )
            .into_response(),
        Err(err) => {
            error!(%user_id, %err, "offline inbox fetch failed");
            error_response(err.envelope_code(), &err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionHistoryQuery {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// `GET /api/messages/session?sessionId=<id>` — presentation-rewritten
/// session history.
pub async fn get_session_messages(
    State(state): State<AppState>,
    Query(query): Query<SessionHistoryQuery>,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return envelope_response(
            StatusCode::BAD_REQUEST,
            Envelope::error(codes::PARAM_INVALID, "sessionId is required"),
        );
    };

    match state
        .dispatcher
        .get_session_messages(&state.shutdown, &session_id)
        .await
    {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "data": {"messages": messages}})),
        )
            .into_response(),
        Err(err) => {
            error!(%session_id, %err, "session history fetch failed");
            error_response(err.envelope_code(), &err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
}

/// `POST /api/messages` — REST fallback for sending a text message into a
/// session, addressed to the automatic responder.
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    if request.session_id.is_empty() || request.sender_id.is_empty() {
        return envelope_response(
            StatusCode::BAD_REQUEST,
            Envelope::error(codes::PARAM_INVALID, "sessionId and senderId are required"),
        );
    }

    let message = Message {
        msg_type: MsgType::Msg,
        session_id: request.session_id,
        sub_session_id: ids::generate_sub_session_id(),
        msg_id: ids::generate_message_id(),
        src: format!("U:{}", request.sender_id),
        dst: "S:auto".to_string(),
        content: request.content,
        content_type: ContentType::Text,
        ts: StringTimestamp::now(),
        status: MsgStatus::New,
        ext: Default::default(),
    };
    let msg_id = message.msg_id.clone();
    let session_id = message.session_id.clone();
    let ts = message.ts;

    match state.dispatcher.send(&state.shutdown, message).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "data": {"msgId": msg_id, "sessionId": session_id, "ts": ts},
            })),
        )
            .into_response(),
        Err(err @ ChatError::InvalidParameter(_)) => {
            error_response(codes::PARAM_INVALID, &err)
        }
        Err(err) => {
            error!(%err, "rest message send failed");
            error_response(err.envelope_code(), &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{
        MemoryMessageRepository, MemorySessionRepository, MemoryUserRepository,
    };
    use crate::repository::{SharedMessageRepo, SharedSessionRepo, SharedUserRepo};
    use axum::body::to_bytes;
    use axum::http::HeaderValue;

    fn state() -> AppState {
        let messages: SharedMessageRepo = Arc::new(MemoryMessageRepository::new());
        let sessions: SharedSessionRepo = Arc::new(MemorySessionRepository::new());
        let users: SharedUserRepo = Arc::new(MemoryUserRepository::new());
        let registry = Arc::new(ConnectionRegistry::new());
        AppState {
            dispatcher: Arc::new(MessageDispatcher::new(
                messages,
                sessions.clone(),
                registry.clone(),
            )),
            users: Arc::new(UserService::new(users, sessions)),
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn init_sets_cookie_and_returns_session() {
        let response = init_user(State(state()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("cland-cid=c"));
        assert!(cookie.contains("Max-Age=31536000"));
        assert!(cookie.contains("HttpOnly"));

        let body = body_json(response).await;
        assert_eq!(body["code"], 200);
        assert!(body["data"]["sessionId"].as_str().unwrap().starts_with("se"));
        assert!(body["data"]["token"].as_str().unwrap().starts_with("ct"));
    }

    #[tokio::test]
    async fn init_honours_cookie_hint() {
        let cid = crate::ids::generate_client_id();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("other=1; cland-cid={cid}")).unwrap(),
        );

        let response = init_user(State(state()), headers).await;
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with(&format!("cland-cid={cid};")));
    }

    #[tokio::test]
    async fn offline_fetch_requires_user_id() {
        let response = get_offline_messages(
            State(state()),
            Query(OfflineQuery { user_id: None }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], codes::PARAM_USER_ID_MISSING);
    }

    #[tokio::test]
    async fn offline_fetch_returns_ok_shape() {
        let response = get_offline_messages(
            State(state()),
            Query(OfflineQuery {
                user_id: Some("c-b".into()),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["data"]["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_health_shape() {
        let response = api_health().await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn rest_send_validates_and_dispatches() {
        let state = state();
        let response = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                session_id: String::new(),
                content: "hello".into(),
                sender_id: "c-a".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send_message(
            State(state.clone()),
            Json(SendMessageRequest {
                session_id: "se-1".into(),
                content: "hello".into(),
                sender_id: "c-a".into(),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["data"]["msgId"].as_str().unwrap().starts_with('m'));
    }
}
