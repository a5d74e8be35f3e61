//! WebSocket push channel and the hub of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::routes::{AppState, user_from_headers};
use crate::error::{DatabaseError, NotifyError};
use crate::store::Database;
use crate::workflow::intake::{Accepted, Submission};
use crate::workflow::notifier::{Notifier, PushMessage};
use crate::workflow::types::{Connection, MessageContext, StatusReport, UserInfo};

// ── Connection hub ──────────────────────────────────────────────────────

/// Registry of live sockets. Each entry is the sending half of the
/// socket's outbound queue; the socket task owns the receiver.
pub struct ConnectionHub {
    db: Arc<dyn Database>,
    connection_ttl: chrono::Duration,
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionHub {
    pub fn new(db: Arc<dyn Database>, connection_ttl: chrono::Duration) -> Self {
        Self {
            db,
            connection_ttl,
            senders: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a connection id, store its record and register the socket.
    pub async fn register(
        &self,
        user_id: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<String>), DatabaseError> {
        let now = Utc::now();
        let connection = Connection {
            connection_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            connected_at: now,
            expires_at: now + self.connection_ttl,
        };
        self.db.put_connection(&connection).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .await
            .insert(connection.connection_id.clone(), tx);
        Ok((connection.connection_id, rx))
    }

    /// Forget a connection. Safe to call more than once.
    pub async fn unregister(&self, connection_id: &str) {
        self.senders.write().await.remove(connection_id);
        if let Err(e) = self.db.delete_connection(connection_id).await {
            warn!(connection_id, error = %e, "Failed to delete connection record");
        }
    }

    /// Number of live sockets.
    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.senders.read().await.is_empty()
    }
}

#[async_trait]
impl Notifier for ConnectionHub {
    async fn push(&self, connection_id: &str, message: &PushMessage) -> Result<(), NotifyError> {
        let connection = self
            .db
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| NotifyError::ConnectionGone(connection_id.to_string()))?;
        if connection.expires_at <= Utc::now() {
            return Err(NotifyError::ConnectionExpired(connection_id.to_string()));
        }

        let json = serde_json::to_string(message).map_err(|e| NotifyError::Encode(e.to_string()))?;
        let senders = self.senders.read().await;
        let tx = senders
            .get(connection_id)
            .ok_or_else(|| NotifyError::ConnectionGone(connection_id.to_string()))?;
        tx.send(json)
            .map_err(|_| NotifyError::ConnectionGone(connection_id.to_string()))
    }
}

// ── JSON protocol ───────────────────────────────────────────────────────

/// Frame from client → server, routed by `action`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientFrame {
    SendMessage {
        #[serde(default)]
        message: String,
        #[serde(default)]
        context: Option<MessageContext>,
    },
    Status {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
}

const KNOWN_ACTIONS: [&str; 2] = ["sendmessage", "status"];

/// Frame from server → client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    Accepted {
        #[serde(flatten)]
        accepted: Accepted,
    },
    Status {
        #[serde(flatten)]
        report: StatusReport,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

impl From<ApiError> for ServerFrame {
    fn from(e: ApiError) -> Self {
        Self::error(e.parts().1)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WsParams {
    user_id: Option<String>,
}

// ── Handlers ────────────────────────────────────────────────────────────

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let mut user = user_from_headers(&headers);
    if user.is_anonymous()
        && let Some(id) = params.user_id.filter(|id| !id.trim().is_empty())
    {
        user.user_id = id.trim().to_string();
    }
    debug!(user_id = %user.user_id, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user: UserInfo) {
    let (connection_id, mut outbound) = match state.hub.register(&user.user_id).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "Failed to register connection");
            return;
        }
    };
    info!(connection_id = %connection_id, user_id = %user.user_id, "WebSocket client connected");

    let hello = ServerFrame::Connected {
        connection_id: connection_id.clone(),
    };
    if send_frame(&mut socket, &hello).await.is_err() {
        state.hub.unregister(&connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            // Pushes from workflow instances
            frame = outbound.recv() => {
                match frame {
                    Some(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during push");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Requests from the client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_frame(&text, &state, &user, &connection_id).await;
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection_id = %connection_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&connection_id).await;
}

async fn handle_client_frame(
    text: &str,
    state: &AppState,
    user: &UserInfo,
    connection_id: &str,
) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Unrecognized WS frame from client");
            let action = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(String::from));
            return match action {
                Some(a) if KNOWN_ACTIONS.contains(&a.as_str()) => ServerFrame::error("invalid request"),
                _ => ServerFrame::error("unknown action"),
            };
        }
    };

    match frame {
        ClientFrame::SendMessage { message, context } => {
            let submission = Submission {
                message,
                context: context.unwrap_or_default(),
                user: user.clone(),
                connection_id: Some(connection_id.to_string()),
            };
            match state.intake.submit(submission).await {
                Ok(accepted) => ServerFrame::Accepted { accepted },
                Err(e) => ApiError::from(e).into(),
            }
        }
        ClientFrame::Status { conversation_id } => {
            match state.status.status(&conversation_id).await {
                Ok(report) => ServerFrame::Status { report },
                Err(e) => ApiError::from(e).into(),
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|e| {
        warn!(error = %e, "Failed to encode WS frame");
    })?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| debug!(error = %e, "Client disconnected during send"))
}
