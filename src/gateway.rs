//! Transport gateway: WebSocket endpoint for event subscribers
//!
//! Each connection is authenticated before the upgrade, registered with
//! the dispatcher, then read only to detect when it goes away. Events
//! are written to the client as JSON text frames.

use crate::dispatcher::{Connection, DispatcherHandle, EventSink};
use crate::error::{EventError, Result};
use crate::topic::is_valid_user_id;
use crate::types::Event;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Query parameter carrying the user id for [`QueryUserAuthenticator`]
pub const USER_ID_PARAM: &str = "user_id";

/// What the client presented when connecting
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub query: HashMap<String, String>,
    /// Token from an `Authorization: Bearer` header
    pub bearer: Option<String>,
}

impl Handshake {
    pub fn from_parts(query: HashMap<String, String>, headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(String::from);
        Self { query, bearer }
    }
}

/// Resolves the user identity of an inbound connection
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the user id, or `EventError::Auth`
    async fn authenticate(&self, handshake: &Handshake) -> Result<String>;
}

/// Trusts the `user_id` query parameter.
///
/// Suitable behind a proxy that has already validated the session.
#[derive(Debug, Clone, Default)]
pub struct QueryUserAuthenticator;

#[async_trait]
impl Authenticator for QueryUserAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<String> {
        let user_id = handshake
            .query
            .get(USER_ID_PARAM)
            .ok_or_else(|| EventError::Auth(format!("missing '{}' parameter", USER_ID_PARAM)))?;
        if !is_valid_user_id(user_id) {
            return Err(EventError::Auth(format!("invalid user id '{}'", user_id)));
        }
        Ok(user_id.clone())
    }
}

/// Maps static bearer tokens to user ids
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, handshake: &Handshake) -> Result<String> {
        let token = handshake
            .bearer
            .as_deref()
            .ok_or_else(|| EventError::Auth("missing bearer token".to_string()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| EventError::Auth("unknown token".to_string()))
    }
}

/// Shared state of the gateway routes
#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: DispatcherHandle,
    pub auth: Arc<dyn Authenticator>,
    /// Store provider name reported by `/health`
    pub store: String,
}

/// Build the gateway router: `GET /events` (WebSocket) and `GET /health`
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/events", get(events_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let handshake = Handshake::from_parts(query, &headers);
    let user_id = match state.auth.authenticate(&handshake).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::info!(error = %e, "Connection rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| serve_connection(socket, user_id, state.dispatcher))
}

async fn health_handler(State(state): State<GatewayState>) -> Response {
    match state.dispatcher.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "status": "ok",
            "store": state.store,
            "users": stats.users,
            "connections": stats.connections,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Writes events to the send half of a WebSocket
struct WsSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    /// Flush pending frames (including a queued Close reply) and close
    async fn close(&self) {
        if let Err(e) = self.sender.lock().await.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.sender
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| EventError::Delivery {
                connection: "websocket".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Register the socket, then read until it fails or closes
async fn serve_connection(socket: WebSocket, user_id: String, dispatcher: DispatcherHandle) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink {
        sender: Mutex::new(sender),
    });
    let connection = Connection::new(sink.clone());
    let id = connection.id();

    if let Err(e) = dispatcher.register(user_id.clone(), connection).await {
        tracing::warn!(user = %user_id, error = %e, "Failed to register connection");
        return;
    }

    tracing::info!(user = %user_id, connection = %id, "WebSocket connection established");

    // Inbound frames carry no meaning; reading only detects disconnects
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(user = %user_id, connection = %id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    sink.close().await;

    if let Err(e) = dispatcher.deregister(user_id.clone(), id).await {
        tracing::debug!(user = %user_id, error = %e, "Deregister after dispatcher stopped");
    }
    tracing::info!(user = %user_id, connection = %id, "WebSocket connection closed");
}
