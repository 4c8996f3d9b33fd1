//! HTTP and WebSocket front end for the [`Broker`].
//!
//! `GET /ws` upgrades to the framed chat socket. The first text frame must
//! be `CONNECT` carrying a ticket from `POST /api/chat/ticket`; the server
//! answers `CONNECTED` and from then on applies every frame to the broker
//! and writes whatever the broker delivers.
//!
//! The JSON endpoints under `/api/chat` mirror the portal's chat API and
//! authenticate with a bearer credential of the form `ROLE:user-id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::{Json, Router};
use concierge_proto::frame::{self, Command, Frame, headers};
use concierge_proto::message::{MessagePage, RoomCode, RoomSummary, Seq};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerError, Identity};

/// Default largest accepted inbound frame, in bytes.
const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

const MAX_PAGE_SIZE: u32 = 100;

/// Shared server state.
pub struct RelayState {
    /// The broker behind every connection.
    pub broker: Arc<Broker>,
    max_frame_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(Arc::new(Broker::new()))
    }
}

impl RelayState {
    /// State around an existing broker with default limits.
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the inbound frame size limit.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn rejection(err: &BrokerError) -> (StatusCode, String) {
    let status = match err {
        BrokerError::InvalidTicket => StatusCode::UNAUTHORIZED,
        BrokerError::UnknownRoom(_) => StatusCode::NOT_FOUND,
        BrokerError::Forbidden { .. } => StatusCode::FORBIDDEN,
    };
    (status, err.to_string())
}

fn authenticate(headers: &HeaderMap) -> Result<Identity, (StatusCode, String)> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(Identity::from_credential)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing or invalid credential".to_string()))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Drive one socket:
///
/// 1. Wait for `CONNECT` and redeem its ticket.
/// 2. Attach to the broker and reply `CONNECTED`.
/// 3. Forward broker deliveries to the socket and socket frames to the
///    broker until either side stops.
/// 4. Detach.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let identity = match wait_for_connect(&mut ws_receiver, &state.broker).await {
        Ok(identity) => identity,
        Err(reason) => {
            tracing::warn!(%reason, "handshake rejected");
            let refusal = frame::encode(&Frame::error(&reason));
            let _ = ws_sender.send(Message::Text(refusal.into())).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    let connected = Frame::connected(identity.user_id.as_str(), identity.role.as_str());
    if ws_sender
        .send(Message::Text(frame::encode(&connected).into()))
        .await
        .is_err()
    {
        return;
    }
    let user = identity.user_id.clone();
    let (id, rx) = state.broker.attach(identity);

    let mut write_task = tokio::spawn(write_loop(ws_sender, rx));

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let text = text.as_str();
                    if frame::is_heartbeat(text) {
                        continue;
                    }
                    if text.len() > reader_state.max_frame_size {
                        tracing::warn!(connection = id, size = text.len(), "frame too large, dropped");
                        continue;
                    }
                    match frame::decode(text) {
                        Ok(frame) => {
                            let disconnect = frame.command == Command::Disconnect;
                            reader_state.broker.handle_frame(id, &frame);
                            if disconnect {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(connection = id, error = %e, "undecodable frame"),
                    }
                }
                Message::Close(_) => {
                    tracing::debug!(connection = id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.broker.detach(id);
    tracing::info!(connection = id, user = %user, "socket closed");
}

/// Write broker deliveries until the broker drops the connection, then close.
async fn write_loop(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        if ws_sender
            .send(Message::Text(frame::encode(&frame).into()))
            .await
            .is_err()
        {
            tracing::warn!("WebSocket write failed");
            return;
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

async fn wait_for_connect(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    broker: &Broker,
) -> Result<Identity, String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if frame::is_heartbeat(text.as_str()) {
                    continue;
                }
                let frame = frame::decode(text.as_str()).map_err(|e| e.to_string())?;
                if frame.command != Command::Connect {
                    return Err(format!("expected CONNECT, got {}", frame.command));
                }
                let ticket = frame
                    .header(headers::TICKET)
                    .ok_or_else(|| "CONNECT without ticket".to_string())?;
                return broker.redeem(ticket).map_err(|e| e.to_string());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err("connection closed before CONNECT".to_string())
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ---------------------------------------------------------------------------
// JSON endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: u32,
    #[serde(default = "default_page_size")]
    size: u32,
}

const fn default_page_size() -> u32 {
    8
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    last_read_seq: Seq,
}

async fn issue_ticket(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> ApiResult<serde_json::Value> {
    let identity = authenticate(&headers)?;
    let ticket = state.broker.issue_ticket(identity);
    Ok(Json(serde_json::json!({ "ticket": ticket })))
}

async fn list_rooms(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<RoomSummary>> {
    let identity = authenticate(&headers)?;
    Ok(Json(state.broker.room_summaries(&identity)))
}

async fn room_messages(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(room): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<MessagePage> {
    let identity = authenticate(&headers)?;
    let size = query.size.clamp(1, MAX_PAGE_SIZE);
    state
        .broker
        .history_page(&identity, &RoomCode::new(room), query.page, size)
        .map(Json)
        .map_err(|e| rejection(&e))
}

async fn mark_read(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Path(room): Path<String>,
    Json(body): Json<ReadRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let identity = authenticate(&headers)?;
    state
        .broker
        .mark_read(&identity, &RoomCode::new(room), body.last_read_seq)
        .map_err(|e| rejection(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unread_counts(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> ApiResult<BTreeMap<RoomCode, u32>> {
    let identity = authenticate(&headers)?;
    Ok(Json(state.broker.unread_counts(&identity)))
}

/// The full router.
pub fn router(state: Arc<RelayState>) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/chat/ticket", post(issue_ticket))
        .route("/api/chat/rooms", get(list_rooms))
        .route("/api/chat/rooms/{room}/messages", get(room_messages))
        .route("/api/chat/rooms/{room}/read", post(mark_read))
        .route("/api/chat/unread", get(unread_counts))
        .with_state(state)
}

/// Start a relay with a fresh broker on `addr`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::default())).await
}

/// Start a relay around a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}
