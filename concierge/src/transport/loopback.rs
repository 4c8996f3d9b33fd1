//! Loopback transport for testing.
//!
//! [`LoopbackTransport::create_pair`] returns the client-side transport and a
//! [`LoopbackServer`] handle that plays the server: it sees every frame the
//! client sends, can push frames back, refuse or fail the next handshake, and
//! drop the current link to simulate a network loss.

use std::sync::Arc;
use std::time::Duration;

use concierge_proto::channel::Channel;
use concierge_proto::codec;
use concierge_proto::event::ServerEvent;
use concierge_proto::frame::{Command, Frame, headers};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Link, LinkEvent, Ticket, Transport, TransportError, TransportType};

/// How the next `open` call is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    Accept,
    Reject(String),
    Unreachable,
}

/// Server end of the current link.
struct ServerSide {
    to_client: mpsc::UnboundedSender<LinkEvent>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

struct State {
    answer: Answer,
    open_delay: Duration,
    open_attempts: usize,
    tickets: Vec<String>,
    current: Option<ServerSide>,
    sent: Vec<Frame>,
    message_counter: u64,
}

/// In-process transport backed by `tokio::sync::mpsc` channels.
#[derive(Clone)]
pub struct LoopbackTransport {
    state: Arc<Mutex<State>>,
}

/// Test-side handle controlling a [`LoopbackTransport`].
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<Mutex<State>>,
}

impl LoopbackTransport {
    /// Create a connected transport / server pair. The server accepts every
    /// handshake until told otherwise.
    #[must_use]
    pub fn create_pair() -> (Self, LoopbackServer) {
        let state = Arc::new(Mutex::new(State {
            answer: Answer::Accept,
            open_delay: Duration::ZERO,
            open_attempts: 0,
            tickets: Vec::new(),
            current: None,
            sent: Vec::new(),
            message_counter: 0,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            LoopbackServer { state },
        )
    }
}

impl Transport for LoopbackTransport {
    async fn open(&self, ticket: &Ticket) -> Result<Link, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.open_attempts += 1;
            state.tickets.push(ticket.as_str().to_string());
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        match state.answer.clone() {
            Answer::Accept => {}
            Answer::Reject(reason) => return Err(TransportError::Rejected(reason)),
            Answer::Unreachable => {
                return Err(TransportError::Unreachable("loopback offline".into()));
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        // A new link replaces the old one; frames the old one carried stay logged.
        if let Some(old) = state.current.take() {
            drain_into(&mut state.sent, old.from_client);
        }
        state.current = Some(ServerSide {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Link::new(out_tx, in_rx, TransportType::Loopback, None))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

fn drain_into(sent: &mut Vec<Frame>, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Ok(frame) = rx.try_recv() {
        sent.push(frame);
    }
}

impl LoopbackServer {
    /// Number of `open` calls observed so far.
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Tickets presented, in order.
    #[must_use]
    pub fn tickets(&self) -> Vec<String> {
        self.state.lock().tickets.clone()
    }

    /// Refuse subsequent handshakes with `reason`.
    pub fn reject_with(&self, reason: &str) {
        self.state.lock().answer = Answer::Reject(reason.to_string());
    }

    /// Fail subsequent opens as if the endpoint were down.
    pub fn go_offline(&self) {
        self.state.lock().answer = Answer::Unreachable;
    }

    /// Accept subsequent handshakes again.
    pub fn go_online(&self) {
        self.state.lock().answer = Answer::Accept;
    }

    /// Delay each `open` by `delay` before answering.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Whether a link is currently open.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.state.lock().current.is_some()
    }

    /// All frames the client has sent, across links, in order.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Frame> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Some(current) = state.current.as_mut() {
            while let Ok(frame) = current.from_client.try_recv() {
                state.sent.push(frame);
            }
        }
        state.sent.clone()
    }

    /// Sent frames with the given command.
    #[must_use]
    pub fn sent_with(&self, command: Command) -> Vec<Frame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| f.command == command)
            .collect()
    }

    /// `SEND` frames addressed to `destination`.
    #[must_use]
    pub fn sent_to(&self, destination: &str) -> Vec<Frame> {
        self.sent_with(Command::Send)
            .into_iter()
            .filter(|f| f.destination() == Some(destination))
            .collect()
    }

    /// Forget all recorded frames.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// The subscription id the client most recently opened for `channel`
    /// and has not closed since.
    #[must_use]
    pub fn subscription_id(&self, channel: &Channel) -> Option<String> {
        let destination = channel.destination();
        let mut active: Vec<(String, String)> = Vec::new();
        for frame in self.sent_frames() {
            match frame.command {
                Command::Subscribe => {
                    if let (Some(id), Some(dest)) = (frame.header(headers::ID), frame.destination()) {
                        active.push((id.to_string(), dest.to_string()));
                    }
                }
                Command::Unsubscribe => {
                    if let Some(id) = frame.header(headers::ID) {
                        active.retain(|(sid, _)| sid != id);
                    }
                }
                _ => {}
            }
        }
        active
            .into_iter()
            .rev()
            .find(|(_, dest)| *dest == destination)
            .map(|(id, _)| id)
    }

    /// Deliver a raw frame to the client. Returns `false` if no link is open.
    pub fn push(&self, frame: Frame) -> bool {
        let state = self.state.lock();
        state
            .current
            .as_ref()
            .is_some_and(|side| side.to_client.send(LinkEvent::Frame(frame)).is_ok())
    }

    /// Deliver an event on `channel` as a `MESSAGE` frame, using the client's
    /// subscription id when one exists.
    pub fn push_event(&self, channel: &Channel, event: &ServerEvent) -> bool {
        let Ok(body) = codec::encode_event(event) else {
            return false;
        };
        let subscription = self.subscription_id(channel).unwrap_or_default();
        let message_id = {
            let mut state = self.state.lock();
            state.message_counter += 1;
            state.message_counter.to_string()
        };
        self.push(Frame::message(
            &subscription,
            &channel.destination(),
            &message_id,
            body,
        ))
    }

    /// Close the current link from the server side.
    pub fn drop_link(&self, reason: &str) {
        let mut state = self.state.lock();
        if let Some(side) = state.current.take() {
            let _ = side.to_client.send(LinkEvent::Closed {
                reason: reason.to_string(),
            });
            drain_into(&mut state.sent, side.from_client);
        }
    }
}
