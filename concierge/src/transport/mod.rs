//! Transport layer abstraction for Concierge.
//!
//! A [`Transport`] turns a single-use [`Ticket`] into an open [`Link`]: a pair
//! of channels carrying decoded frames in each direction. Concrete
//! implementations:
//! - [`ws::WsTransport`]: WebSocket carrying STOMP-style text frames
//! - [`loopback::LoopbackTransport`]: in-process link for tests
//! - [`fallback::FallbackTransport`]: tries a preferred transport, then a fallback

pub mod fallback;
pub mod loopback;
pub mod ws;

use std::fmt;

use concierge_proto::frame::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Single-use credential exchanged for a realtime link.
///
/// The value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Ticket(String);

impl Ticket {
    /// Wraps a ticket value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw ticket.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ticket(..)")
    }
}

/// Describes which kind of transport carried a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket text frames.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur while opening or using a link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint could not be reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The server refused the handshake (bad or spent ticket).
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The peer violated the frame protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Authentication failures are not retried automatically.
    #[must_use]
    pub const fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Something the link's reader observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A decoded inbound frame.
    Frame(Frame),
    /// The link closed. No further events follow.
    Closed {
        /// Why the link closed.
        reason: String,
    },
}

/// An open link returned by [`Transport::open`].
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    transport_type: TransportType,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Assemble a link from its channels. `reader` is aborted when the
    /// sending half is dropped; writers are expected to finish on their own
    /// once the outbound channel closes.
    #[must_use]
    pub const fn new(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
        transport_type: TransportType,
        reader: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            transport_type,
            reader,
        }
    }

    /// The kind of transport that opened this link.
    #[must_use]
    pub const fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    /// Split into the sending half and the inbound event stream.
    #[must_use]
    pub fn split(self) -> (LinkSender, mpsc::UnboundedReceiver<LinkEvent>) {
        (
            LinkSender {
                outbound: self.outbound,
                transport_type: self.transport_type,
                reader: self.reader,
            },
            self.inbound,
        )
    }
}

/// Sending half of a [`Link`]. Dropping it closes the link.
#[derive(Debug)]
pub struct LinkSender {
    outbound: mpsc::UnboundedSender<Frame>,
    transport_type: TransportType,
    reader: Option<JoinHandle<()>>,
}

impl LinkSender {
    /// Queue a frame for the writer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the writer has gone.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Whether the writer is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// The kind of transport behind this link.
    #[must_use]
    pub const fn transport_type(&self) -> TransportType {
        self.transport_type
    }
}

impl Drop for LinkSender {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens realtime links.
///
/// Implementations perform the connection handshake, presenting the ticket,
/// and return only once the server has acknowledged it. A rejected handshake
/// is reported as [`TransportError::Rejected`].
pub trait Transport: Send + Sync + 'static {
    /// Open a new link authenticated by `ticket`.
    fn open(
        &self,
        ticket: &Ticket,
    ) -> impl std::future::Future<Output = Result<Link, TransportError>> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
