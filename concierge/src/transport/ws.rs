//! WebSocket transport carrying STOMP-style text frames.
//!
//! [`WsTransport::open`] connects, sends a `CONNECT` frame presenting the
//! ticket, and waits for `CONNECTED`. An `ERROR` reply means the ticket was
//! refused. After the handshake a reader task decodes inbound text into
//! [`LinkEvent`]s and a writer task encodes outbound frames.

use std::time::Duration;

use concierge_proto::frame::{self, Command, Frame, headers};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Link, LinkEvent, Ticket, Transport, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for the TCP + WebSocket upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the `CONNECTED` acknowledgment.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket transport implementing [`Transport`].
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    host: String,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WsTransport {
    /// Create a transport for the given `ws://` or `wss://` endpoint.
    ///
    /// The `host` header of the handshake defaults to the URL's host.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            url,
            host,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Override both timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, handshake: Duration) -> Self {
        self.connect_timeout = connect;
        self.handshake_timeout = handshake;
        self
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open_inner(&self, ticket: &Ticket) -> Result<Link, TransportError> {
        let url = self.url.as_str();
        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(url))
                .await
                .map_err(|_| {
                    tracing::warn!(url, "WebSocket connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url, err = %e, "WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let connect = Frame::connect(&self.host, ticket.as_str());
        ws_sender
            .send(Message::Text(frame::encode(&connect).into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send CONNECT frame");
                TransportError::Io(std::io::Error::other(format!("failed to send CONNECT: {e}")))
            })?;

        let ack = tokio::time::timeout(self.handshake_timeout, await_handshake(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url, "CONNECTED acknowledgment timed out");
                TransportError::Timeout
            })??;
        tracing::info!(
            url,
            user_id = ack.header(headers::USER_ID).unwrap_or("?"),
            "realtime link established"
        );

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(ws_reader, in_tx));
        tokio::spawn(writer_loop(ws_sender, out_rx));

        Ok(Link::new(out_tx, in_rx, TransportType::WebSocket, Some(reader)))
    }
}

impl Transport for WsTransport {
    async fn open(&self, ticket: &Ticket) -> Result<Link, TransportError> {
        self.open_inner(ticket).await
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

/// Read until the server answers the `CONNECT` frame.
async fn await_handshake(ws_reader: &mut WsReader) -> Result<Frame, TransportError> {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if frame::is_heartbeat(text.as_str()) {
                    continue;
                }
                let reply = frame::decode(text.as_str()).map_err(|e| {
                    tracing::warn!(err = %e, "malformed handshake reply");
                    TransportError::Protocol(format!("malformed handshake reply: {e}"))
                })?;
                return match reply.command {
                    Command::Connected => Ok(reply),
                    Command::Error => {
                        let reason = reply
                            .header(headers::MESSAGE)
                            .unwrap_or("connection refused")
                            .to_string();
                        tracing::warn!(reason = %reason, "handshake rejected");
                        Err(TransportError::Rejected(reason))
                    }
                    other => Err(TransportError::Protocol(format!(
                        "unexpected {other} during handshake"
                    ))),
                };
            }
            Ok(Message::Close(_)) => {
                tracing::warn!("server closed connection during handshake");
                return Err(TransportError::ConnectionClosed);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Decode inbound text frames into link events.
///
/// Malformed frames are logged and skipped; the link stays up. Exactly one
/// [`LinkEvent::Closed`] is sent when the socket ends.
async fn reader_loop(mut ws_reader: WsReader, tx: mpsc::UnboundedSender<LinkEvent>) {
    let reason = loop {
        match ws_reader.next().await {
            Some(Ok(Message::Text(text))) => {
                if frame::is_heartbeat(text.as_str()) {
                    continue;
                }
                match frame::decode(text.as_str()) {
                    Ok(frame) => {
                        if tx.send(LinkEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed frame, skipping");
                    }
                }
            }
            Some(Ok(Message::Close(close))) => {
                tracing::info!("WebSocket closed by server");
                break close.map_or_else(
                    || "closed by server".to_string(),
                    |c| c.reason.as_str().to_string(),
                );
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break e.to_string();
            }
            None => break "stream ended".to_string(),
        }
    };
    let _ = tx.send(LinkEvent::Closed { reason });
    tracing::debug!("reader task exiting");
}

/// Encode outbound frames until the sending half is dropped, then close.
async fn writer_loop(mut ws_sender: WsSender, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = ws_sender.send(Message::Text(frame::encode(&frame).into())).await {
            tracing::warn!(err = %e, "WebSocket send failed");
            return;
        }
    }
    let _ = ws_sender.close().await;
    tracing::debug!("writer task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::Rejected(format!("HTTP {status}"))
            } else {
                TransportError::Unreachable(format!("HTTP {status}"))
            }
        }
        WsError::Url(e) => TransportError::Unreachable(e.to_string()),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// How the stub server answers the `CONNECT` frame.
    enum Reply {
        Accept,
        Reject,
        AcceptThenClose,
    }

    /// Accept one connection, answer the handshake, push `pushed` text
    /// messages, then either close or hold the socket open.
    async fn stub_server(reply: Reply, pushed: Vec<String>) -> String {
        use tokio_tungstenite::tungstenite as ws;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let Some(Ok(ws::Message::Text(text))) = socket.next().await else {
                return;
            };
            let connect = frame::decode(text.as_str()).unwrap();
            assert_eq!(connect.command, Command::Connect);
            assert_eq!(connect.header(headers::TICKET), Some("good"));

            let answer = match reply {
                Reply::Reject => Frame::error("ticket expired"),
                _ => Frame::connected("u-1", "END_USER"),
            };
            socket
                .send(ws::Message::Text(frame::encode(&answer).into()))
                .await
                .unwrap();
            for text in pushed {
                socket.send(ws::Message::Text(text.into())).await.unwrap();
            }
            match reply {
                Reply::Accept => {
                    while socket.next().await.is_some() {}
                }
                Reply::Reject | Reply::AcceptThenClose => {
                    let _ = socket.close(None).await;
                }
            }
        });
        format!("ws://{addr}/ws")
    }

    #[tokio::test]
    async fn handshake_then_frames_flow_in() {
        let message = Frame::message("s-0", "/topic/rooms", "1", "{}");
        let url = stub_server(
            Reply::Accept,
            vec!["\n".into(), "garbage".into(), frame::encode(&message)],
        )
        .await;

        let link = WsTransport::new(url).open(&Ticket::new("good")).await.unwrap();
        assert_eq!(link.transport_type(), TransportType::WebSocket);
        let (_sender, mut inbound) = link.split();

        // Heart-beat and garbage are skipped; the link survives them.
        let event = inbound.recv().await.unwrap();
        assert_eq!(event, LinkEvent::Frame(message));
    }

    #[tokio::test]
    async fn rejected_ticket_is_auth_failure() {
        let url = stub_server(Reply::Reject, vec![]).await;
        let err = WsTransport::new(url)
            .open(&Ticket::new("good"))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn server_close_emits_closed_event() {
        let url = stub_server(Reply::AcceptThenClose, vec![]).await;
        let link = WsTransport::new(url).open(&Ticket::new("good")).await.unwrap();
        let (_sender, mut inbound) = link.split();
        let event = inbound.recv().await.unwrap();
        assert!(matches!(event, LinkEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WsTransport::new(format!("ws://{addr}/ws"))
            .open(&Ticket::new("good"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportError::Unreachable(_) | TransportError::Io(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn host_is_taken_from_url() {
        let transport = WsTransport::new("wss://chat.example.com/ws");
        assert_eq!(transport.host, "chat.example.com");
        assert_eq!(transport.url(), "wss://chat.example.com/ws");
    }
}
