//! Widget-facing HTTP API.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use chatlink_core::{CustomEvent, EngineError, MessageStatus, UserIdentity};
use chatlink_hub::{ConnectRequest, Hub, SendMessageRequest};

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/connect", post(connect))
        .route("/api/messages", post(send_message))
        .route("/api/messages/{id}", patch(edit_message).delete(delete_message))
        .route("/api/read", post(mark_read))
        .route("/api/identify", post(identify))
        .route("/api/events", post(custom_event))
        .route("/api/typing", post(typing))
        .with_state(hub)
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::SessionNotFound(_) | EngineError::MessageNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::MessageDeleted(_) => StatusCode::CONFLICT,
            EngineError::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Best-effort client address, trusting the proxy's forwarded header.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

async fn connect(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Json(mut req): Json<ConnectRequest>,
) -> Result<Response, ApiError> {
    req.ip = client_ip(&headers);
    req.country = headers
        .get("CF-IPCountry")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let response = hub.connect(req).await?;
    Ok(Json(response).into_response())
}

async fn send_message(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let (message, delivery) = hub.send_message(req).await?;
    Ok(Json(json!({ "message": message, "delivery": delivery })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditRequest {
    session_id: String,
    content: String,
}

async fn edit_message(
    State(hub): State<Arc<Hub>>,
    Path(message_id): Path<String>,
    Json(req): Json<EditRequest>,
) -> Result<Response, ApiError> {
    let (message, delivery) = hub
        .edit_message(&req.session_id, &message_id, &req.content)
        .await?;
    Ok(Json(json!({ "message": message, "delivery": delivery })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    session_id: String,
}

async fn delete_message(
    State(hub): State<Arc<Hub>>,
    Path(message_id): Path<String>,
    Json(req): Json<DeleteRequest>,
) -> Result<Response, ApiError> {
    let delivery = hub.delete_message(&req.session_id, &message_id).await?;
    Ok(Json(json!({ "ok": true, "delivery": delivery })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    session_id: String,
    message_ids: Vec<String>,
    status: MessageStatus,
}

async fn mark_read(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<ReadRequest>,
) -> Result<Response, ApiError> {
    let changed = hub
        .mark_read(&req.session_id, &req.message_ids, req.status)
        .await?;
    Ok(Json(json!({ "updated": changed })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyRequest {
    session_id: String,
    identity: UserIdentity,
    #[serde(default)]
    user_phone: Option<String>,
}

async fn identify(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<IdentifyRequest>,
) -> Result<Response, ApiError> {
    hub.identify(&req.session_id, req.identity, req.user_phone)
        .await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest {
    session_id: String,
    name: String,
    #[serde(default)]
    data: serde_json::Value,
}

async fn custom_event(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<EventRequest>,
) -> Result<Response, ApiError> {
    let handled = hub
        .handle_custom_event(
            &req.session_id,
            CustomEvent {
                name: req.name,
                data: req.data,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true, "handled": handled })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingRequest {
    session_id: String,
    typing: bool,
}

async fn typing(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<TypingRequest>,
) -> Result<Response, ApiError> {
    hub.visitor_typing(&req.session_id, req.typing).await;
    Ok(Json(json!({ "ok": true })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlink_core::Sender;

    #[test]
    fn forwarded_header_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.9"));
        assert_eq!(client_ip(&HeaderMap::new()), None);
    }

    #[test]
    fn sender_field_deserializes_lowercase() {
        let req: SendMessageRequest = serde_json::from_value(json!({
            "sessionId": "s-1",
            "content": "hi",
            "sender": "visitor"
        }))
        .unwrap();
        assert_eq!(req.sender, Sender::Visitor);
    }
}
