//! WebSocket and HTTP front end for the relay dispatcher.
//!
//! Routes:
//! - `GET /` liveness text
//! - `GET /health` occupancy as JSON
//! - `POST /api/create-room` provisions a room, answers `{"roomId": ...}`
//! - `GET /ws` upgrades to the signaling WebSocket (JSON text frames)

use crate::dispatcher::RelayHandle;
use crate::protocol::{ClientMessage, ErrorCode, RelayError};
use crate::relay::RelayConfig;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ServerState {
    handle: RelayHandle,
    allowed_origin: HeaderValue,
}

/// Relay server bound to a TCP listener
pub struct RelayServer {
    listener: TcpListener,
    handle: RelayHandle,
    allowed_origin: HeaderValue,
}

impl RelayServer {
    /// Bind the listener and start a dispatcher
    ///
    /// # Errors
    ///
    /// Returns error if binding fails.
    pub async fn bind(addr: SocketAddr, config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handle: RelayHandle::spawn(config),
            allowed_origin: HeaderValue::from_static("*"),
        })
    }

    /// Set the `Access-Control-Allow-Origin` value for HTTP responses
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Io`] if the value is not a valid header value.
    pub fn with_allowed_origin(mut self, origin: &str) -> Result<Self, RelayError> {
        self.allowed_origin = HeaderValue::from_str(origin)
            .map_err(|e| RelayError::Io(format!("invalid origin {origin:?}: {e}")))?;
        Ok(self)
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the dispatcher backing this server
    #[must_use]
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Serve until the listener fails
    ///
    /// # Errors
    ///
    /// Returns error if accepting connections fails.
    pub async fn run(self) -> Result<(), RelayError> {
        info!("Relay server listening on {}", self.local_addr()?);
        let app = router(self.handle, self.allowed_origin);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// Build the relay router around an existing dispatcher
pub fn router(handle: RelayHandle, allowed_origin: HeaderValue) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(health_check))
        .route("/api/create-room", post(create_room).options(cors_preflight))
        .route("/ws", get(ws_handler))
        .with_state(ServerState {
            handle,
            allowed_origin,
        })
}

async fn serve_root() -> &'static str {
    "RoomLink relay running"
}

async fn health_check(State(state): State<ServerState>) -> Response {
    match state.handle.stats().await {
        Ok(stats) => Json(json!({
            "status": "ok",
            "rooms": stats.rooms,
            "connections": stats.connections,
        }))
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn create_room(State(state): State<ServerState>) -> Response {
    let mut response = match state.handle.create_room().await {
        Ok(room_id) => Json(json!({ "roomId": room_id })).into_response(),
        Err(RelayError::Rejected(code)) => {
            (StatusCode::SERVICE_UNAVAILABLE, code.default_message()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    with_cors(&mut response, &state.allowed_origin);
    response
}

async fn cors_preflight(State(state): State<ServerState>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    with_cors(&mut response, &state.allowed_origin);
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    response
}

fn with_cors(response: &mut Response, origin: &HeaderValue) {
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.handle))
}

/// Pump one WebSocket between the client and the dispatcher
async fn handle_socket(socket: WebSocket, handle: RelayHandle) {
    let connection = match handle.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Rejecting WebSocket: {}", e);
            return;
        }
    };
    let (sender, mut inbound) = connection.into_parts();
    let id = sender.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unserializable {}: {}", message.message_type(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                Ok(message) => {
                    if sender.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Malformed frame from {}: {}", id, e);
                    if sender.reject(ErrorCode::InvalidMessage).is_err() {
                        break;
                    }
                }
            },
            Ok(Message::Binary(_)) => {
                if sender.reject(ErrorCode::InvalidMessage).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ping/Pong handled by axum
            Err(e) => {
                debug!("WebSocket error on {}: {}", id, e);
                break;
            }
        }
    }

    // Dropping the sender disconnects; the dispatcher then closes `inbound`
    drop(sender);
    let _ = send_task.await;
}
