//! Connection supervisor.
//!
//! Owns the realtime link for a session:
//!
//! - `connect` is single-flight: callers that arrive while an attempt is in
//!   flight wait for it and share its outcome instead of starting another.
//! - Losing the link while a connection is still wanted starts a reconnect
//!   task with exponential backoff. After `max_attempts` consecutive failures
//!   it gives up and emits [`SupervisorEvent::GaveUp`] so dependents can fall
//!   back to polling.
//! - `disconnect` is synchronous: when it returns the link is gone, the
//!   reconnect task is cancelled and listeners have been told.
//!
//! Inbound frames and lifecycle changes are forwarded on an unbounded
//! channel returned by [`ConnectionSupervisor::new`]. Every link gets a new
//! epoch number so events from a link that has already been replaced can be
//! recognized and dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use concierge_proto::frame::Frame;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::api::{ApiError, ChatApi};
use crate::config::ReconnectConfig;
use crate::transport::{LinkEvent, LinkSender, Transport, TransportError, TransportType};

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The link is up.
    Connected,
}

/// Why a connect attempt failed. Cloneable so one outcome can be handed to
/// every caller that joined the attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The ticket exchange failed.
    #[error("ticket exchange failed: {0}")]
    Credential(ApiError),

    /// The server refused the ticket during the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The transport could not open a link.
    #[error("transport failed: {0}")]
    Transport(String),

    /// `disconnect` was called while the attempt was in flight.
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

impl ConnectError {
    /// Authentication problems are never retried automatically.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Credential(_) | Self::Rejected(_))
    }
}

/// Something the supervisor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// An inbound frame on the current link.
    Frame(Frame),
    /// A link came up.
    Up {
        /// Link number.
        epoch: u64,
        /// Transport that carried it.
        transport: TransportType,
    },
    /// The link went down unexpectedly.
    Down {
        /// Link number.
        epoch: u64,
        /// Why.
        reason: String,
    },
    /// The reconnect loop stopped without success.
    GaveUp {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },
}

/// Handle returned by [`ConnectionSupervisor::add_listener`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner<T, A> {
    transport: T,
    api: Arc<A>,
    policy: ReconnectConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<LinkSender>>,
    epoch: AtomicU64,
    gate: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    last_outcome: Mutex<Option<Result<(), ConnectError>>>,
    wanted: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

/// Supervises the realtime link. Clones share the same link.
pub struct ConnectionSupervisor<T, A> {
    inner: Arc<Inner<T, A>>,
}

impl<T, A> Clone for ConnectionSupervisor<T, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, A: ChatApi> ConnectionSupervisor<T, A> {
    /// Create a supervisor and the receiver for its events.
    pub fn new(
        transport: T,
        api: Arc<A>,
        policy: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            transport,
            api,
            policy,
            state,
            link: Mutex::new(None),
            epoch: AtomicU64::new(0),
            gate: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            wanted: AtomicBool::new(false),
            pump: Mutex::new(None),
            reconnect: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            events,
        });
        (Self { inner }, rx)
    }

    /// Exchange a ticket and open the link.
    ///
    /// Returns immediately if already connected. A call that arrives while
    /// another attempt is in flight waits for that attempt and returns its
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] describing why the attempt failed.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let seen = self.inner.completed.load(Ordering::SeqCst);
        let _gate = self.inner.gate.lock().await;
        if self.inner.completed.load(Ordering::SeqCst) != seen {
            let shared = self.inner.last_outcome.lock().clone();
            if let Some(outcome) = shared {
                return outcome;
            }
        }
        if self.is_connected() {
            return Ok(());
        }

        self.inner.wanted.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnect.lock().take() {
            task.abort();
        }
        let outcome = Inner::attempt(&self.inner).await;
        self.inner.record(&outcome);
        outcome
    }

    /// Tear down the link and stop reconnecting.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.wanted.store(false, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = inner.reconnect.lock().take() {
            task.abort();
        }
        if let Some(task) = inner.pump.lock().take() {
            task.abort();
        }
        let link = inner.link.lock().take();
        if let Some(link) = link {
            let _ = link.send(Frame::disconnect());
        }
        inner.set_state(ConnectionState::Disconnected);
        tracing::info!("disconnected");
    }

    /// Whether the link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Send a frame on the current link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if there is no link.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let link = self.inner.link.lock();
        link.as_ref()
            .map_or(Err(TransportError::ConnectionClosed), |l| l.send(frame))
    }

    /// Register a callback invoked with `true`/`false` whenever the link
    /// comes up or goes down.
    pub fn add_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of connect attempts that have completed.
    #[must_use]
    pub fn attempts_completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }
}

impl<T: Transport, A: ChatApi> Inner<T, A> {
    async fn attempt(inner: &Arc<Self>) -> Result<(), ConnectError> {
        inner.set_state(ConnectionState::Connecting);

        let ticket = match inner.api.issue_ticket().await {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(err = %e, "ticket exchange failed");
                inner.set_state(ConnectionState::Disconnected);
                return Err(ConnectError::Credential(e));
            }
        };

        let link = match inner.transport.open(&ticket).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(err = %e, "failed to open link");
                inner.set_state(ConnectionState::Disconnected);
                return Err(if e.is_auth_failure() {
                    ConnectError::Rejected(e.to_string())
                } else {
                    ConnectError::Transport(e.to_string())
                });
            }
        };

        if !inner.wanted.load(Ordering::SeqCst) {
            inner.set_state(ConnectionState::Disconnected);
            return Err(ConnectError::Cancelled);
        }

        let transport = link.transport_type();
        let (sender, inbound) = link.split();
        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.link.lock() = Some(sender);
        inner.set_state(ConnectionState::Connected);
        tracing::info!(epoch, %transport, "connected");
        let _ = inner.events.send(SupervisorEvent::Up { epoch, transport });

        let pump = tokio::spawn(pump(Arc::downgrade(inner), epoch, inbound));
        if let Some(old) = inner.pump.lock().replace(pump) {
            old.abort();
        }
        Ok(())
    }

    fn record(&self, outcome: &Result<(), ConnectError>) {
        *self.last_outcome.lock() = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        let was_up = previous == ConnectionState::Connected;
        let is_up = next == ConnectionState::Connected;
        if was_up != is_up {
            self.notify(is_up);
        }
    }

    fn notify(&self, connected: bool) {
        let listeners: Vec<Listener> = self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
                tracing::warn!("connectivity listener panicked");
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn on_link_lost(inner: &Arc<Self>, epoch: u64, reason: String) {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        inner.link.lock().take();
        inner.set_state(ConnectionState::Disconnected);
        tracing::warn!(epoch, reason = %reason, "link lost");
        let _ = inner.events.send(SupervisorEvent::Down { epoch, reason });

        if inner.wanted.load(Ordering::SeqCst) {
            let task = tokio::spawn(reconnect_loop(Arc::downgrade(inner)));
            if let Some(old) = inner.reconnect.lock().replace(task) {
                old.abort();
            }
        }
    }

    fn give_up(&self, attempts: u32, reason: String) {
        tracing::info!(attempts, reason = %reason, "giving up on reconnect");
        let _ = self.events.send(SupervisorEvent::GaveUp { attempts, reason });
    }
}

/// Forward inbound link events until the link closes.
async fn pump<T: Transport, A: ChatApi>(
    weak: Weak<Inner<T, A>>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(LinkEvent::Frame(frame)) => {
                let Some(inner) = weak.upgrade() else { return };
                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                let _ = inner.events.send(SupervisorEvent::Frame(frame));
            }
            Some(LinkEvent::Closed { reason }) => break reason,
            None => break "link dropped".to_string(),
        }
    };
    if let Some(inner) = weak.upgrade() {
        Inner::on_link_lost(&inner, epoch, reason);
    }
}

/// Retry with exponential backoff until connected, cancelled or out of budget.
async fn reconnect_loop<T: Transport, A: ChatApi>(weak: Weak<Inner<T, A>>) {
    let mut failures: u32 = 0;
    loop {
        let delay = match weak.upgrade() {
            Some(inner) => inner.policy.delay_for(failures),
            None => return,
        };
        tracing::info!(attempt = failures + 1, delay_ms = delay.as_millis(), "reconnecting");
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        let outcome = {
            let _gate = inner.gate.lock().await;
            if inner.is_connected() || !inner.wanted.load(Ordering::SeqCst) {
                return;
            }
            let outcome = Inner::attempt(&inner).await;
            inner.record(&outcome);
            outcome
        };

        match outcome {
            Ok(()) => {
                tracing::info!(attempts = failures + 1, "reconnected");
                return;
            }
            Err(ConnectError::Cancelled) => return,
            Err(e) if e.is_fatal() => {
                inner.give_up(failures + 1, e.to_string());
                return;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(attempt = failures, err = %e, "reconnect attempt failed");
                if failures >= inner.policy.max_attempts {
                    inner.give_up(failures, e.to_string());
                    return;
                }
            }
        }
    }
}
