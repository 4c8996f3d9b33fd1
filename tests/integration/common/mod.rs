//! Shared harness: an in-process relay and sessions connected to it over
//! real sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use concierge::api::http::HttpChatApi;
use concierge::session::{Session, SessionConfig, SessionEvent};
use concierge::transport::ws::WsTransport;
use concierge_proto::message::{Role, RoomCode, UserId};
use concierge_relay::broker::{Broker, Identity};
use concierge_relay::server::{self, RelayState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long any single wait may take before the test fails.
pub const WAIT: Duration = Duration::from_secs(5);

/// A running relay.
pub struct Relay {
    pub addr: SocketAddr,
    pub broker: Arc<Broker>,
    pub handle: JoinHandle<()>,
}

impl Relay {
    pub async fn start() -> Self {
        let broker = Arc::new(Broker::new());
        let state = Arc::new(RelayState::new(Arc::clone(&broker)));
        let (addr, handle) = server::start_server_with_state("127.0.0.1:0", state)
            .await
            .expect("failed to start relay");
        Self {
            addr,
            broker,
            handle,
        }
    }

    /// Create `room` owned by end user `owner`.
    pub fn room(&self, room: &str, owner: &str) -> RoomCode {
        let code = RoomCode::new(room);
        self.broker.create_room(&code, &UserId::new(owner));
        code
    }

    /// A session for `user` with fast reconnects. Not yet connected.
    pub fn peer(&self, user: &str, role: Role) -> Peer {
        let mut config = SessionConfig::new(user, role);
        config.reconnect.initial_delay = Duration::from_millis(20);
        config.reconnect.max_delay = Duration::from_millis(100);
        config.reconnect.max_attempts = 3;
        config.chat.reconcile_interval = Duration::from_millis(200);

        let credential = Identity::new(user, role).credential();
        let api = HttpChatApi::new(&format!("http://{}/api", self.addr), Some(credential), WAIT)
            .expect("valid API URL");
        let transport = WsTransport::new(format!("ws://{}/ws", self.addr));
        let (session, events) = Session::new(transport, api, config);
        Peer {
            session,
            events,
            seen: Vec::new(),
        }
    }

    /// A connected session for `user`.
    pub async fn connected(&self, user: &str, role: Role) -> Peer {
        let mut peer = self.peer(user, role);
        peer.session.connect().await.expect("connect");
        peer.next_event("link up", |e| {
            matches!(e, SessionEvent::ConnectionChanged { connected: true, .. })
        })
        .await;
        peer
    }
}

/// A session plus its event receiver.
pub struct Peer {
    pub session: Session<WsTransport, HttpChatApi>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub seen: Vec<SessionEvent>,
}

impl Peer {
    /// Drive the session until an event matching `pred` is emitted.
    pub async fn next_event(
        &mut self,
        what: &str,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            while let Ok(event) = self.events.try_recv() {
                let hit = pred(&event);
                self.seen.push(event.clone());
                if hit {
                    return event;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}; saw {:#?}",
                self.seen
            );
            let _ = tokio::time::timeout_at(deadline, self.session.step()).await;
        }
    }

    /// Drive the session until `pred` holds for its state.
    pub async fn until(
        &mut self,
        what: &str,
        pred: impl Fn(&Session<WsTransport, HttpChatApi>) -> bool,
    ) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !pred(&self.session) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            let _ = tokio::time::timeout_at(deadline, self.session.step()).await;
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
        }
    }

    /// Keep driving the session for `duration`.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline {
            let _ = tokio::time::timeout_at(deadline, self.session.step()).await;
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
        }
    }

    /// Contents of the confirmed messages in `room`, oldest first.
    pub fn contents(&self, room: &RoomCode) -> Vec<String> {
        self.session
            .stream(room)
            .map(|s| s.messages().iter().map(|m| m.content.clone()).collect())
            .unwrap_or_default()
    }
}
