//! The session: one user's view of the chat system.
//!
//! [`Session`] owns every piece of client state (supervisor, router, room
//! registry, message streams, read cursors, unread aggregates) and is the
//! only thing that mutates it. Work that has to wait (history fetches,
//! refetches, polling) runs on spawned tasks that report back over an
//! internal channel; the host drives the session by calling
//! [`Session::step`] in its event loop, or [`Session::drain`] to process
//! whatever is already queued. Everything the host might render arrives as a
//! [`SessionEvent`] on the channel returned by [`Session::new`].
//!
//! ```text
//!   supervisor events ──┐
//!   task results ───────┼──▶ Session::step ──▶ SessionEvent channel
//!   housekeeping tick ──┘
//! ```

mod events;

pub use events::{Notice, NoticeKind, SessionEvent};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use concierge_proto::action::ClientAction;
use concierge_proto::channel::Channel;
use concierge_proto::codec::{self, CodecError};
use concierge_proto::event::{EventBody, EventType, ReadStatus, RoomStateUpdate, ServerEvent};
use concierge_proto::frame::{Command, Frame, headers};
use concierge_proto::message::{
    ChatMessage, ContentError, MessagePage, Role, RoomCode, RoomSummary, Seq, UserId,
    validate_content,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::api::{ApiError, ChatApi};
use crate::config::{ChatConfig, ReconnectConfig};
use crate::receipts::{ReadCursors, ReconcileLimiter};
use crate::room::{HandoffRequest, RoomError, RoomRegistry, StateOutcome};
use crate::router::{HandlerError, SubscriptionRouter, SubscriptionToken};
use crate::stream::{
    MergeOutcome, MessageStream, PageRequest, ScrollAnchor, ScrollIntent, StreamError, TempId,
    Viewport,
};
use crate::supervisor::{ConnectError, ConnectionSupervisor, ListenerId, SupervisorEvent};
use crate::transport::{Transport, TransportError, TransportType};
use crate::unread::{DeliveryMode, UnreadSource, UnreadTracker};

/// Who the session acts as and how it is tuned.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The user this session acts as.
    pub user_id: UserId,
    /// The role this session acts in.
    pub role: Role,
    /// Chat-layer tuning.
    pub chat: ChatConfig,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    /// Defaults for everything but identity.
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: UserId::new(user_id),
            role,
            chat: ChatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The link could not be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A chat API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A room action was rejected locally.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A history operation failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A send failed.
    #[error(transparent)]
    Send(#[from] SendError),

    /// The operation needs the realtime link.
    #[error("not connected")]
    NotConnected,

    /// The room has not been opened.
    #[error("room {0} is not open")]
    RoomNotOpen(RoomCode),

    /// An outbound action could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The link refused a frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from sending a chat message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The content was rejected before sending.
    #[error(transparent)]
    Validation(#[from] ContentError),

    /// The room does not accept messages from the caller right now.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The room has not been opened.
    #[error("room {0} is not open")]
    RoomNotOpen(RoomCode),

    /// The realtime link is down.
    #[error("not connected")]
    NotConnected,

    /// The link refused the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The pending send is unknown or not retryable.
    #[error(transparent)]
    Pending(#[from] StreamError),
}

type PageResult = Result<MessagePage, ApiError>;

/// Results reported by spawned work.
enum TaskResult {
    Rooms(Result<Vec<RoomSummary>, ApiError>),
    Unread(Result<BTreeMap<RoomCode, u32>, ApiError>),
    Poll {
        rooms: Result<Vec<RoomSummary>, ApiError>,
        unread: Result<BTreeMap<RoomCode, u32>, ApiError>,
    },
    InitialPage {
        request: PageRequest,
        result: PageResult,
    },
    OlderPage {
        request: PageRequest,
        anchor: Option<ScrollAnchor>,
        result: PageResult,
    },
    Preload {
        request: PageRequest,
        result: PageResult,
    },
    Reconcile {
        request: PageRequest,
        result: PageResult,
    },
}

/// One user's chat session.
pub struct Session<T: Transport, A: ChatApi> {
    config: SessionConfig,
    api: Arc<A>,
    supervisor: ConnectionSupervisor<T, A>,
    supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    router: SubscriptionRouter,
    rooms: RoomRegistry,
    streams: HashMap<RoomCode, MessageStream>,
    joined: BTreeSet<RoomCode>,
    viewports: HashMap<RoomCode, Viewport>,
    cursors: ReadCursors,
    limiter: ReconcileLimiter,
    unread: UnreadTracker,
    events: mpsc::Sender<SessionEvent>,
    tasks_tx: mpsc::UnboundedSender<TaskResult>,
    tasks_rx: mpsc::UnboundedReceiver<TaskResult>,
    poller: Option<JoinHandle<()>>,
    preloads: HashMap<RoomCode, JoinHandle<()>>,
    fetches: HashMap<RoomCode, Vec<JoinHandle<()>>>,
    generations: HashMap<RoomCode, u64>,
    deferred_reads: HashMap<RoomCode, ReadStatus>,
    housekeeping: Interval,
}

impl<T: Transport, A: ChatApi> Session<T, A> {
    /// Create a disconnected session. Must be called within a Tokio runtime.
    pub fn new(transport: T, api: A, config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let api = Arc::new(api);
        let (supervisor, supervisor_events) =
            ConnectionSupervisor::new(transport, Arc::clone(&api), config.reconnect.clone());
        let (events, events_rx) = mpsc::channel(config.chat.event_buffer.max(1));
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let mut router = SubscriptionRouter::new();
        for channel in [Channel::RoomList, Channel::Unread, Channel::Errors] {
            let _ = router.retain(&channel);
        }

        let period = config.chat.reconcile_interval.max(Duration::from_millis(100));
        let mut housekeeping = tokio::time::interval(period);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let session = Self {
            limiter: ReconcileLimiter::new(config.chat.reconcile_interval),
            config,
            api,
            supervisor,
            supervisor_events,
            router,
            rooms: RoomRegistry::new(),
            streams: HashMap::new(),
            joined: BTreeSet::new(),
            viewports: HashMap::new(),
            cursors: ReadCursors::new(),
            unread: UnreadTracker::new(),
            events,
            tasks_tx,
            tasks_rx,
            poller: None,
            preloads: HashMap::new(),
            fetches: HashMap::new(),
            generations: HashMap::new(),
            deferred_reads: HashMap::new(),
            housekeeping,
        };
        (session, events_rx)
    }

    // -- driving --------------------------------------------------------

    /// Wait for the next piece of work and process it.
    pub async fn step(&mut self) {
        tokio::select! {
            Some(event) = self.supervisor_events.recv() => self.on_supervisor_event(event),
            Some(result) = self.tasks_rx.recv() => self.on_task_result(result),
            _ = self.housekeeping.tick() => self.tick(),
        }
    }

    /// Process everything already queued without waiting. Returns how many
    /// items were handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.supervisor_events.try_recv() {
                self.on_supervisor_event(event);
            } else if let Ok(result) = self.tasks_rx.try_recv() {
                self.on_task_result(result);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    // -- connection -----------------------------------------------------

    /// Connect (or join an attempt already in flight) and process the result.
    ///
    /// # Errors
    ///
    /// [`SessionError::Connect`] if the ticket exchange or handshake failed.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.supervisor.connect().await?;
        self.drain();
        Ok(())
    }

    /// Tear down the link, stop polling and fail in-flight sends.
    pub fn disconnect(&mut self) {
        self.supervisor.disconnect();
        self.stop_polling();
        self.on_link_down("disconnected");
    }

    /// Whether the realtime link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    /// How updates currently arrive.
    #[must_use]
    pub const fn delivery_mode(&self) -> DeliveryMode {
        self.unread.mode()
    }

    /// Register a connectivity listener.
    pub fn add_connectivity_listener(
        &self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> ListenerId {
        self.supervisor.add_listener(listener)
    }

    /// Remove a connectivity listener.
    pub fn remove_connectivity_listener(&self, id: ListenerId) -> bool {
        self.supervisor.remove_listener(id)
    }

    // -- subscriptions --------------------------------------------------

    /// Register a handler for every event on `channel`.
    pub fn subscribe_channel(
        &mut self,
        channel: Channel,
        handler: impl Fn(&Channel, &ServerEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let (token, frame) = self.router.subscribe(channel, Arc::new(handler));
        if let Some(frame) = frame {
            self.transmit(frame);
        }
        token
    }

    /// Register a handler for some event types on `channel`.
    pub fn subscribe_typed(
        &mut self,
        channel: Channel,
        kinds: &[EventType],
        handler: impl Fn(&Channel, &ServerEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let (token, frame) = self.router.subscribe_typed(channel, kinds, Arc::new(handler));
        if let Some(frame) = frame {
            self.transmit(frame);
        }
        token
    }

    /// Make `handler` the primary for `channel`, replacing the previous one.
    pub fn set_primary_handler(
        &mut self,
        channel: &Channel,
        handler: impl Fn(&Channel, &ServerEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) {
        if let Some(frame) = self.router.set_primary(channel, Arc::new(handler)) {
            self.transmit(frame);
        }
    }

    /// Remove `channel`'s primary. Returns `false` if it had none.
    pub fn clear_primary_handler(&mut self, channel: &Channel) -> bool {
        match self.router.clear_primary(channel) {
            Some(frame) => {
                if let Some(frame) = frame {
                    self.transmit(frame);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a handler. Returns `false` if the token was unknown.
    pub fn unsubscribe(&mut self, token: &SubscriptionToken) -> bool {
        match self.router.unsubscribe(token) {
            Some(frame) => {
                if let Some(frame) = frame {
                    self.transmit(frame);
                }
                true
            }
            None => false,
        }
    }

    // -- rooms ----------------------------------------------------------

    /// Known rooms.
    #[must_use]
    pub const fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// An open room's message stream.
    #[must_use]
    pub fn stream(&self, room: &RoomCode) -> Option<&MessageStream> {
        self.streams.get(room)
    }

    /// Unread aggregates.
    #[must_use]
    pub const fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// The session's configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the room list from the chat API.
    ///
    /// # Errors
    ///
    /// [`SessionError::Api`] if the fetch failed.
    pub async fn refresh_rooms(&mut self) -> Result<usize, SessionError> {
        let rooms = self.api.fetch_rooms().await?;
        let count = rooms.len();
        self.apply_room_snapshot(rooms, UnreadSource::Snapshot);
        Ok(count)
    }

    /// Open a room: subscribe to it, announce presence and load the most
    /// recent page. Returns how many messages the page added.
    ///
    /// # Errors
    ///
    /// [`SessionError::Api`] if the history fetch failed; the room stays open.
    pub async fn open_room(&mut self, room: &RoomCode) -> Result<usize, SessionError> {
        if !self.streams.contains_key(room) {
            self.rooms.ensure(room);
            // Continue the generation count of an earlier stream for this room
            // so its late page results stay stale.
            let generation = self.generations.get(room).copied().unwrap_or(0);
            self.streams.insert(
                room.clone(),
                MessageStream::new(room.clone(), &self.config.chat).starting_at(generation),
            );
            self.joined.insert(room.clone());
            if let Some(frame) = self.router.retain(&Channel::Room(room.clone())) {
                self.transmit(frame);
            }
            if self.is_connected() {
                self.transmit_action(&ClientAction::JoinRoom {
                    room_code: room.clone(),
                })?;
            }
            tracing::info!(room = %room, "opened room");
        }

        let request = self.stream_mut(room)?.begin_initial();
        let page = self
            .api
            .fetch_page(room, request.page_index, request.page_size)
            .await?;
        let stream = self.stream_mut(room)?;
        let added = stream.apply_initial(request.generation, page)?;
        let event = SessionEvent::MessagesLoaded {
            room: room.clone(),
            count: stream.messages().len(),
            has_more: stream.has_more(),
        };
        self.emit(event);
        Ok(added)
    }

    /// Load the next older page now, using a preloaded page if one is ready.
    /// Returns how many messages were added; `0` when there is no more
    /// history.
    ///
    /// # Errors
    ///
    /// [`SessionError::RoomNotOpen`], [`SessionError::Api`], or
    /// [`SessionError::Stream`] when a load is already running.
    pub async fn load_older(
        &mut self,
        room: &RoomCode,
        viewport: Option<Viewport>,
    ) -> Result<usize, SessionError> {
        let anchor = viewport.as_ref().map(ScrollAnchor::capture);
        let stream = self.stream_mut(room)?;
        if let Some((page_index, page)) = stream.take_preloaded() {
            let generation = stream.generation();
            let added = stream.apply_older(generation, page_index, page)?;
            self.emit_prepended(room, added, anchor);
            return Ok(added);
        }
        let request = match stream.begin_older() {
            Ok(request) => request,
            Err(StreamError::Exhausted) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let result = self
            .api
            .fetch_page(room, request.page_index, request.page_size)
            .await;
        let stream = self.stream_mut(room)?;
        match result {
            Ok(page) => {
                let added = stream.apply_older(request.generation, request.page_index, page)?;
                self.emit_prepended(room, added, anchor);
                Ok(added)
            }
            Err(e) => {
                stream.abort_older(request.generation);
                Err(e.into())
            }
        }
    }

    /// Report the room view's scroll geometry. Preloads or loads older
    /// history as the reader approaches the top.
    pub fn on_scroll(&mut self, room: &RoomCode, viewport: Viewport) -> ScrollIntent {
        self.viewports.insert(room.clone(), viewport);
        let intent = self.classify(&viewport);
        match intent {
            ScrollIntent::Idle => {}
            ScrollIntent::Preload => {
                self.start_preload(room);
            }
            ScrollIntent::LoadOlder => self.show_older(room, ScrollAnchor::capture(&viewport)),
        }
        intent
    }

    /// Fetch the next older page in the background. Returns `false` if
    /// nothing was started.
    pub fn start_preload(&mut self, room: &RoomCode) -> bool {
        let Some(request) = self.streams.get_mut(room).and_then(MessageStream::begin_preload) else {
            return false;
        };
        tracing::debug!(room = %room, page = request.page_index, "preloading older page");
        let handle = self.spawn_page(request, |request, result| TaskResult::Preload { request, result });
        if let Some(old) = self.preloads.insert(room.clone(), handle) {
            old.abort();
        }
        true
    }

    /// Close a room: drop its handlers, cancel its page fetches and forget
    /// its messages. Returns `false` if it was not open.
    pub fn leave_room(&mut self, room: &RoomCode) -> bool {
        let Some(stream) = self.streams.remove(room) else {
            return false;
        };
        self.generations.insert(room.clone(), stream.generation());
        self.joined.remove(room);
        self.viewports.remove(room);
        self.deferred_reads.remove(room);
        self.limiter.forget(room);
        if let Some(preload) = self.preloads.remove(room) {
            preload.abort();
        }
        for fetch in self.fetches.remove(room).unwrap_or_default() {
            fetch.abort();
        }
        if let Some(frame) = self.router.close_channel(&Channel::Room(room.clone())) {
            self.transmit(frame);
        }
        tracing::info!(room = %room, "left room");
        true
    }

    /// Leave a room and forget it entirely. Returns `false` if it was unknown.
    pub fn evict_room(&mut self, room: &RoomCode) -> bool {
        let was_open = self.leave_room(room);
        let was_known = self.rooms.remove(room).is_some();
        self.unread.forget(room);
        self.cursors.forget(room);
        was_open || was_known
    }

    // -- sending --------------------------------------------------------

    /// Send a chat message. It shows up immediately as a pending entry and
    /// is replaced when the server echoes it.
    ///
    /// # Errors
    ///
    /// Rejections happen before anything is sent: invalid content, a room
    /// guard ([`RoomError::AutomatedAgentActive`] and friends), a room that is
    /// not open, or no link. Each also produces a [`Notice`].
    pub fn send(&mut self, room: &RoomCode, content: &str) -> Result<TempId, SendError> {
        if let Err(e) = validate_content(content) {
            self.notice(NoticeKind::Validation, Some(room), e.to_string());
            return Err(e.into());
        }
        self.check_send(room)?;

        let user = self.config.user_id.clone();
        let sender_type = self.config.role.sender_type();
        let stream = self
            .streams
            .get_mut(room)
            .ok_or_else(|| SendError::RoomNotOpen(room.clone()))?;
        let temp_id = stream.push_pending(content, user, sender_type, Instant::now());
        self.emit(SessionEvent::MessagePending {
            room: room.clone(),
            temp_id: temp_id.clone(),
        });
        self.transmit_send(room, content, &temp_id)?;
        Ok(temp_id)
    }

    /// Re-send a failed message under the same temporary id.
    ///
    /// # Errors
    ///
    /// Same guards as [`Session::send`], plus [`SendError::Pending`] if the
    /// entry is unknown or has not failed.
    pub fn retry_send(&mut self, room: &RoomCode, temp_id: &TempId) -> Result<(), SendError> {
        self.check_send(room)?;
        let stream = self
            .streams
            .get_mut(room)
            .ok_or_else(|| SendError::RoomNotOpen(room.clone()))?;
        let content = stream.retry(temp_id, Instant::now())?;
        self.transmit_send(room, &content, temp_id)
    }

    /// Drop a pending message.
    ///
    /// # Errors
    ///
    /// [`SendError::RoomNotOpen`] or [`SendError::Pending`].
    pub fn discard_pending(&mut self, room: &RoomCode, temp_id: &TempId) -> Result<(), SendError> {
        self.streams
            .get_mut(room)
            .ok_or_else(|| SendError::RoomNotOpen(room.clone()))?
            .discard(temp_id)?;
        Ok(())
    }

    fn check_send(&self, room: &RoomCode) -> Result<(), SendError> {
        if let Err(e) = self.rooms.check_send(room, &self.config.user_id, self.config.role) {
            tracing::debug!(room = %room, err = %e, "send rejected locally");
            self.notice(NoticeKind::for_room_error(&e), Some(room), e.to_string());
            return Err(e.into());
        }
        if !self.streams.contains_key(room) {
            return Err(SendError::RoomNotOpen(room.clone()));
        }
        if !self.is_connected() {
            self.notice(NoticeKind::Delivery, Some(room), "not connected; message not sent".into());
            return Err(SendError::NotConnected);
        }
        Ok(())
    }

    fn transmit_send(&mut self, room: &RoomCode, content: &str, temp_id: &TempId) -> Result<(), SendError> {
        let action = ClientAction::SendMessage {
            room_code: room.clone(),
            content: content.to_string(),
            client_ref: Some(temp_id.as_str().to_string()),
        };
        let result = action
            .to_frame()
            .map_err(SendError::from)
            .and_then(|frame| self.supervisor.send(frame).map_err(SendError::from));
        if let Err(e) = &result {
            tracing::warn!(room = %room, err = %e, "send failed");
            if let Some(stream) = self.streams.get_mut(room) {
                stream.fail_pending(temp_id);
            }
            self.emit(SessionEvent::SendFailed {
                room: room.clone(),
                temp_id: temp_id.clone(),
                reason: e.to_string(),
            });
        }
        result
    }

    // -- handoff --------------------------------------------------------

    /// End user asks for a human operator.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub fn request_handoff(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        self.request(room, HandoffRequest::Request)
    }

    /// End user withdraws a waiting request.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub fn cancel_handoff(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        self.request(room, HandoffRequest::Cancel)
    }

    /// Hand the room back to the automated agent.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub fn request_automated_return(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        self.request(room, HandoffRequest::Return)
    }

    /// Operator takes over from the automated agent.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub fn intervene(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        self.request(room, HandoffRequest::Intervene)
    }

    /// Operator accepts a waiting handoff.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub fn accept_handoff(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        self.request(room, HandoffRequest::Accept)
    }

    /// Send a handoff request. The room's state does not change until the
    /// server's state update arrives.
    ///
    /// # Errors
    ///
    /// [`SessionError::Room`] when the role or current state does not allow
    /// the request, [`SessionError::NotConnected`] without a link.
    pub fn request(&mut self, room: &RoomCode, request: HandoffRequest) -> Result<(), SessionError> {
        let action = match self.rooms.check_request(room, self.config.role, request) {
            Ok(action) => action,
            Err(e) => {
                self.notice(NoticeKind::for_room_error(&e), Some(room), e.to_string());
                return Err(e.into());
            }
        };
        if !self.is_connected() {
            self.notice(NoticeKind::Connection, Some(room), "not connected".into());
            return Err(SessionError::NotConnected);
        }
        self.transmit_action(&action)?;
        tracing::debug!(room = %room, %request, "handoff request sent");
        Ok(())
    }

    // -- read receipts --------------------------------------------------

    /// Mark `room` read up to `last_seen`: over the socket when live, through
    /// the chat API otherwise. Local unread markers on the caller's side are
    /// cleared straight away and a refetch is scheduled to confirm them.
    ///
    /// # Errors
    ///
    /// [`SessionError::Api`] if the REST call failed, or a transport error.
    pub async fn mark_read(&mut self, room: &RoomCode, last_seen: Seq) -> Result<(), SessionError> {
        let live = self.is_connected();
        if live {
            self.transmit_action(&ClientAction::MarkRead {
                room_code: room.clone(),
                last_read_seq: last_seen,
            })?;
        } else {
            self.api.mark_read(room, last_seen).await?;
        }

        let party = self.config.role.party();
        self.cursors.advance(room, party, last_seen);
        let cleared = self
            .streams
            .get_mut(room)
            .map(|stream| stream.zero_unread(party, last_seen))
            .unwrap_or_default();
        if !cleared.is_empty() {
            self.emit(SessionEvent::UnreadMarkersCleared {
                room: room.clone(),
                party,
                up_to: last_seen,
                ids: cleared,
            });
        }
        if self.unread.clear(room) {
            self.rooms.set_unread(room, 0);
            self.emit_unread_total();
        }
        if live {
            self.transmit_action(&ClientAction::RequestUnreadCount)?;
        }
        self.schedule_reconcile(room);
        Ok(())
    }

    // -- inbound --------------------------------------------------------

    fn on_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Frame(frame) => self.on_frame(&frame),
            SupervisorEvent::Up { epoch, transport } => self.on_link_up(epoch, transport),
            SupervisorEvent::Down { reason, .. } => self.on_link_down(&reason),
            SupervisorEvent::GaveUp { attempts, reason } => self.on_gave_up(attempts, &reason),
        }
    }

    fn on_link_up(&mut self, epoch: u64, transport: TransportType) {
        tracing::info!(epoch, %transport, "session online");
        for frame in self.router.on_link_up() {
            self.transmit(frame);
        }
        let joined: Vec<RoomCode> = self.joined.iter().cloned().collect();
        for room_code in joined {
            self.transmit_or_log(&ClientAction::JoinRoom { room_code });
        }

        self.stop_polling();
        self.set_mode(DeliveryMode::Live);
        self.transmit_or_log(&ClientAction::RequestUnreadCount);

        // Catch up on whatever happened while the link was down.
        self.spawn_room_refresh();
        let loaded: Vec<RoomCode> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_loaded())
            .map(|(room, _)| room.clone())
            .collect();
        for room in loaded {
            self.spawn_reconcile(&room);
        }

        self.emit(SessionEvent::ConnectionChanged {
            connected: true,
            transport: Some(transport),
        });
    }

    fn on_link_down(&mut self, reason: &str) {
        self.router.on_link_down();
        if self.unread.mode() == DeliveryMode::Live {
            self.set_mode(DeliveryMode::Offline);
        }

        let mut failed = Vec::new();
        for (room, stream) in &mut self.streams {
            for temp_id in stream.fail_all_pending() {
                failed.push((room.clone(), temp_id));
            }
        }
        if !failed.is_empty() {
            tracing::warn!(count = failed.len(), "link lost with sends in flight");
            self.notice(
                NoticeKind::Delivery,
                None,
                format!("{} message(s) were not delivered", failed.len()),
            );
        }
        for (room, temp_id) in failed {
            self.emit(SessionEvent::SendFailed {
                room,
                temp_id,
                reason: reason.to_string(),
            });
        }
        self.emit(SessionEvent::ConnectionChanged {
            connected: false,
            transport: None,
        });
    }

    fn on_gave_up(&mut self, attempts: u32, reason: &str) {
        tracing::warn!(attempts, reason, "realtime link unavailable; falling back to polling");
        self.set_mode(DeliveryMode::Polling);
        self.start_polling();
        self.notice(
            NoticeKind::Connection,
            None,
            format!("live updates unavailable ({reason}); refreshing periodically"),
        );
    }

    fn on_frame(&mut self, frame: &Frame) {
        match frame.command {
            Command::Message => self.on_message_frame(frame),
            Command::Error => {
                let message = frame.header(headers::MESSAGE).unwrap_or("server error");
                tracing::warn!(message, "server sent ERROR frame");
                self.notice(NoticeKind::Connection, None, message.to_string());
            }
            other => tracing::debug!(command = other.as_str(), "ignoring frame"),
        }
    }

    fn on_message_frame(&mut self, frame: &Frame) {
        let Some(channel) = self.router.route(frame) else {
            tracing::warn!(destination = ?frame.destination(), "dropping frame for unknown channel");
            return;
        };
        let event = match codec::decode_event(&frame.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%channel, err = %e, "dropping malformed event");
                return;
            }
        };
        tracing::debug!(%channel, kind = event.kind().as_str(), "event");
        self.apply_event(&event);
        let report = self.router.dispatch(&channel, &event);
        if report.failed > 0 {
            tracing::debug!(%channel, failed = report.failed, "some handlers failed");
        }
    }

    fn apply_event(&mut self, event: &ServerEvent) {
        if let (Some(update), Some(room)) = (&event.room_state, event.room_code()) {
            self.apply_room_state(room, update);
        }
        match &event.body {
            EventBody::ChatMessage(message) | EventBody::SystemMessage(message) => {
                self.on_live_message(message.clone());
            }
            EventBody::AdminAssignment(assignment) => {
                if self
                    .rooms
                    .apply_assignment(&assignment.room_code, assignment.operator.clone())
                {
                    self.emit(SessionEvent::RoomUpdated {
                        room: assignment.room_code.clone(),
                    });
                }
            }
            EventBody::HandoffState(_) => {}
            EventBody::ReadStatus(status) => self.on_read_status(status),
            EventBody::RoomPreview(preview) => {
                self.rooms.apply_preview(preview);
                if let Some(count) = preview.unread_count {
                    if self.unread.set(UnreadSource::Live, &preview.room_code, count) {
                        self.emit_unread_total();
                    }
                }
                self.emit(SessionEvent::RoomUpdated {
                    room: preview.room_code.clone(),
                });
            }
            EventBody::UnreadCounts(update) => {
                if self.unread.apply(UnreadSource::Live, &update.counts) {
                    for (room, count) in &update.counts {
                        self.rooms.set_unread(room, *count);
                    }
                    self.emit_unread_total();
                }
            }
            EventBody::Error(notice) => {
                tracing::warn!(code = %notice.code, message = %notice.message, "server rejected an action");
                self.notice(
                    NoticeKind::for_code(&notice.code),
                    notice.room_code.as_ref(),
                    notice.message.clone(),
                );
            }
        }
    }

    fn apply_room_state(&mut self, room: &RoomCode, update: &RoomStateUpdate) {
        match self.rooms.apply_state_update(room, update) {
            Ok(outcome) => self.report_state(room, &outcome, update.transition_reason.clone()),
            Err(e) => {
                tracing::warn!(room = %room, err = %e, "rejected handoff transition; resyncing rooms");
                self.spawn_room_refresh();
            }
        }
    }

    fn report_state(&self, room: &RoomCode, outcome: &StateOutcome, reason: Option<String>) {
        match outcome {
            StateOutcome::Transitioned { from, to } => {
                self.emit(SessionEvent::HandoffChanged {
                    room: room.clone(),
                    from: *from,
                    to: *to,
                    reason,
                });
                match outcome.attention_change() {
                    Some(true) => self.emit(SessionEvent::AttentionRaised { room: room.clone() }),
                    Some(false) => self.emit(SessionEvent::AttentionCleared { room: room.clone() }),
                    None => {}
                }
            }
            StateOutcome::Refreshed => self.emit(SessionEvent::RoomUpdated { room: room.clone() }),
            StateOutcome::Stale => {}
        }
    }

    fn on_live_message(&mut self, message: ChatMessage) {
        let room = message.room_code.clone();
        self.rooms.note_message(&room, &message.content, message.sent_at);
        let viewport = self.viewports.get(&room).copied();
        let Some(stream) = self.streams.get_mut(&room) else {
            self.emit(SessionEvent::RoomUpdated { room });
            return;
        };
        let event = match stream.merge_live(message, viewport.as_ref(), Instant::now()) {
            MergeOutcome::Appended { id, autoscroll } => SessionEvent::MessageAppended {
                room,
                id,
                autoscroll,
            },
            MergeOutcome::Inserted { id, index } => SessionEvent::MessageInserted { room, id, index },
            MergeOutcome::Confirmed {
                temp_id,
                id,
                autoscroll,
            } => SessionEvent::MessageConfirmed {
                room,
                temp_id,
                id,
                autoscroll,
            },
            MergeOutcome::Duplicate => {
                tracing::debug!(room = %room, "duplicate message ignored");
                return;
            }
        };
        self.emit(event);
    }

    fn on_read_status(&mut self, status: &ReadStatus) {
        let room = &status.room_code;
        let Some(stream) = self.streams.get_mut(room) else {
            return;
        };
        let cursor = match status.last_read_seq.or_else(|| stream.max_seq()) {
            Some(cursor) if !stream.messages().is_empty() => cursor,
            _ => {
                // Nothing buffered to apply it to; reload and apply it then.
                tracing::debug!(room = %room, "read status on empty buffer; reloading");
                let request = stream.begin_initial();
                self.deferred_reads.insert(room.clone(), status.clone());
                self.spawn_fetch(request, |request, result| TaskResult::InitialPage { request, result });
                return;
            }
        };

        // The reader has read the other side's messages.
        let party = status.reader_role.other();
        self.cursors.advance(room, status.reader_role, cursor);
        let cleared = stream.zero_unread(party, cursor);
        if cleared.is_empty() {
            return;
        }
        self.emit(SessionEvent::UnreadMarkersCleared {
            room: room.clone(),
            party,
            up_to: cursor,
            ids: cleared,
        });
        self.schedule_reconcile(room);
    }

    // -- task results ---------------------------------------------------

    fn on_task_result(&mut self, result: TaskResult) {
        match result {
            TaskResult::Rooms(Ok(rooms)) => self.apply_room_snapshot(rooms, UnreadSource::Snapshot),
            TaskResult::Unread(Ok(counts)) => {
                if self.unread.apply(UnreadSource::Snapshot, &counts) {
                    self.emit_unread_total();
                }
            }
            TaskResult::Rooms(Err(e)) | TaskResult::Unread(Err(e)) => {
                tracing::warn!(err = %e, "background refresh failed");
            }
            TaskResult::Poll { rooms, unread } => self.on_poll(rooms, unread),
            TaskResult::InitialPage { request, result } => self.on_initial_page(request, result),
            TaskResult::OlderPage {
                request,
                anchor,
                result,
            } => self.on_older_page(&request, anchor, result),
            TaskResult::Preload { request, result } => self.on_preload(request, result),
            TaskResult::Reconcile { request, result } => self.on_reconcile(&request, result),
        }
    }

    fn on_poll(
        &mut self,
        rooms: Result<Vec<RoomSummary>, ApiError>,
        unread: Result<BTreeMap<RoomCode, u32>, ApiError>,
    ) {
        if self.unread.mode() != DeliveryMode::Polling {
            tracing::debug!("discarding poll result: no longer polling");
            return;
        }
        match rooms {
            Ok(rooms) => self.apply_room_snapshot(rooms, UnreadSource::Polling),
            Err(e) => tracing::warn!(err = %e, "poll: room fetch failed"),
        }
        match unread {
            Ok(counts) => {
                if self.unread.apply(UnreadSource::Polling, &counts) {
                    self.emit_unread_total();
                }
            }
            Err(e) => tracing::warn!(err = %e, "poll: unread fetch failed"),
        }
    }

    fn on_initial_page(&mut self, request: PageRequest, result: PageResult) {
        let room = request.room.clone();
        let Some(stream) = self.streams.get_mut(&room) else {
            return;
        };
        match result.map_err(SessionError::from).and_then(|page| {
            stream
                .apply_initial(request.generation, page)
                .map_err(SessionError::from)
        }) {
            Ok(_) => {
                let loaded = !stream.messages().is_empty();
                let event = SessionEvent::MessagesLoaded {
                    room: room.clone(),
                    count: stream.messages().len(),
                    has_more: stream.has_more(),
                };
                self.emit(event);
                if let Some(status) = self.deferred_reads.remove(&room) {
                    if loaded {
                        self.on_read_status(&status);
                    }
                }
            }
            Err(e) => tracing::debug!(room = %room, err = %e, "initial page discarded"),
        }
    }

    fn on_older_page(&mut self, request: &PageRequest, anchor: Option<ScrollAnchor>, result: PageResult) {
        let Some(stream) = self.streams.get_mut(&request.room) else {
            return;
        };
        match result {
            Ok(page) => match stream.apply_older(request.generation, request.page_index, page) {
                Ok(added) => self.emit_prepended(&request.room, added, anchor),
                Err(e) => tracing::debug!(room = %request.room, err = %e, "older page discarded"),
            },
            Err(e) => {
                stream.abort_older(request.generation);
                tracing::warn!(room = %request.room, err = %e, "older page fetch failed");
            }
        }
    }

    fn on_preload(&mut self, request: PageRequest, result: PageResult) {
        let room = request.room.clone();
        self.preloads.remove(&room);
        let Some(stream) = self.streams.get_mut(&room) else {
            tracing::debug!(room = %room, "preload for closed room discarded");
            return;
        };
        match result {
            Ok(page) => {
                if let Err(e) = stream.store_preload(request.generation, request.page_index, page) {
                    tracing::debug!(room = %room, err = %e, "preload discarded");
                    return;
                }
            }
            Err(e) => {
                if stream.generation() == request.generation {
                    stream.cancel_preload();
                }
                tracing::warn!(room = %room, err = %e, "preload failed");
                return;
            }
        }

        // The reader may already be at the top waiting for it.
        if let Some(viewport) = self.viewports.get(&room).copied() {
            if self.classify(&viewport) == ScrollIntent::LoadOlder {
                self.show_older(&room, ScrollAnchor::capture(&viewport));
            }
        }
    }

    fn on_reconcile(&mut self, request: &PageRequest, result: PageResult) {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::debug!(room = %request.room, err = %e, "reconcile fetch failed");
                return;
            }
        };
        let Some(stream) = self.streams.get_mut(&request.room) else {
            return;
        };
        if stream.generation() != request.generation {
            return;
        }
        let outcome = stream.reconcile(page);
        if outcome.added > 0 || outcome.updated > 0 {
            tracing::debug!(room = %request.room, added = outcome.added, updated = outcome.updated, "reconciled");
            self.emit(SessionEvent::MessagesReconciled {
                room: request.room.clone(),
                added: outcome.added,
                updated: outcome.updated,
            });
        }
    }

    fn apply_room_snapshot(&mut self, summaries: Vec<RoomSummary>, source: UnreadSource) {
        let mut counts = BTreeMap::new();
        let mut codes = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let room = summary.room_code.clone();
            counts.insert(room.clone(), summary.unread_count);
            let outcome = self.rooms.upsert_summary(summary);
            if matches!(outcome, StateOutcome::Transitioned { .. }) {
                self.report_state(&room, &outcome, None);
            }
            codes.push(room);
        }
        if self.unread.apply(source, &counts) {
            self.emit_unread_total();
        }
        self.emit(SessionEvent::RoomsRefreshed { rooms: codes });
    }

    // -- background work ------------------------------------------------

    fn classify(&self, viewport: &Viewport) -> ScrollIntent {
        ScrollIntent::classify(viewport, self.config.chat.preload_ratio, self.config.chat.load_ratio)
    }

    fn show_older(&mut self, room: &RoomCode, anchor: ScrollAnchor) {
        let Some(stream) = self.streams.get_mut(room) else {
            return;
        };
        if let Some((page_index, page)) = stream.take_preloaded() {
            let generation = stream.generation();
            match stream.apply_older(generation, page_index, page) {
                Ok(added) => self.emit_prepended(room, added, Some(anchor)),
                Err(e) => tracing::debug!(room = %room, err = %e, "preloaded page discarded"),
            }
            return;
        }
        // A running preload is shown when it lands.
        if let Ok(request) = stream.begin_older() {
            self.spawn_fetch(request, move |request, result| TaskResult::OlderPage {
                request,
                anchor: Some(anchor),
                result,
            });
        }
    }

    fn spawn_page(
        &self,
        request: PageRequest,
        wrap: impl FnOnce(PageRequest, PageResult) -> TaskResult + Send + 'static,
    ) -> JoinHandle<()> {
        let api = Arc::clone(&self.api);
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let result = api
                .fetch_page(&request.room, request.page_index, request.page_size)
                .await;
            let _ = tx.send(wrap(request, result));
        })
    }

    /// Spawn a page fetch that [`Session::leave_room`] cancels.
    fn spawn_fetch(
        &mut self,
        request: PageRequest,
        wrap: impl FnOnce(PageRequest, PageResult) -> TaskResult + Send + 'static,
    ) {
        let room = request.room.clone();
        let handle = self.spawn_page(request, wrap);
        let fetches = self.fetches.entry(room).or_default();
        fetches.retain(|fetch| !fetch.is_finished());
        fetches.push(handle);
    }

    fn spawn_room_refresh(&self) {
        let api = Arc::clone(&self.api);
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            let rooms = api.fetch_rooms().await;
            let _ = tx.send(TaskResult::Rooms(rooms));
        });
    }

    /// Refetch `room` now, or once the limiter allows it from [`Session::tick`].
    fn schedule_reconcile(&mut self, room: &RoomCode) {
        if self.limiter.try_acquire(room, Instant::now()) {
            self.spawn_reconcile(room);
        } else {
            tracing::trace!(room = %room, "reconcile deferred");
        }
    }

    fn spawn_reconcile(&mut self, room: &RoomCode) {
        let Some(stream) = self.streams.get(room) else {
            return;
        };
        let request = PageRequest {
            room: room.clone(),
            page_index: 0,
            page_size: self.config.chat.initial_page_size,
            generation: stream.generation(),
        };
        self.spawn_fetch(request, |request, result| TaskResult::Reconcile { request, result });
    }

    fn start_polling(&mut self) {
        if self.poller.is_some() {
            return;
        }
        let api = Arc::clone(&self.api);
        let tx = self.tasks_tx.clone();
        let period = self.config.chat.poll_interval.max(Duration::from_millis(100));
        tracing::info!(period_secs = period.as_secs(), "polling started");
        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let rooms = api.fetch_rooms().await;
                let unread = api.fetch_unread_counts().await;
                if tx.send(TaskResult::Poll { rooms, unread }).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
            tracing::info!("polling stopped");
        }
    }

    /// Fail pending sends that have waited longer than the echo window and
    /// run reconciliations the limiter held back. [`Session::step`] runs this
    /// periodically.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (room, stream) in &mut self.streams {
            for temp_id in stream.expire_pending(now) {
                expired.push((room.clone(), temp_id));
            }
        }
        for (room, temp_id) in expired {
            tracing::warn!(room = %room, %temp_id, "no confirmation for pending message");
            self.emit(SessionEvent::SendFailed {
                room,
                temp_id,
                reason: "no confirmation from server".into(),
            });
        }

        for room in self.limiter.take_due(now) {
            self.spawn_reconcile(&room);
        }
    }

    // -- helpers --------------------------------------------------------

    fn stream_mut(&mut self, room: &RoomCode) -> Result<&mut MessageStream, SessionError> {
        self.streams
            .get_mut(room)
            .ok_or_else(|| SessionError::RoomNotOpen(room.clone()))
    }

    fn transmit(&self, frame: Frame) {
        if let Err(e) = self.supervisor.send(frame) {
            tracing::debug!(err = %e, "outbound frame dropped");
        }
    }

    fn transmit_action(&self, action: &ClientAction) -> Result<(), SessionError> {
        let frame = action.to_frame()?;
        self.supervisor.send(frame)?;
        Ok(())
    }

    fn transmit_or_log(&self, action: &ClientAction) {
        if let Err(e) = self.transmit_action(action) {
            tracing::warn!(destination = %action.destination(), err = %e, "failed to send action");
        }
    }

    fn set_mode(&mut self, mode: DeliveryMode) {
        if self.unread.set_mode(mode) {
            self.emit(SessionEvent::DeliveryModeChanged { mode });
        }
    }

    fn emit_prepended(&self, room: &RoomCode, added: usize, anchor: Option<ScrollAnchor>) {
        let has_more = self.streams.get(room).is_some_and(MessageStream::has_more);
        self.emit(SessionEvent::MessagesPrepended {
            room: room.clone(),
            added,
            has_more,
            anchor,
        });
    }

    fn emit_unread_total(&self) {
        self.emit(SessionEvent::UnreadCountsChanged {
            total: self.unread.total(),
        });
    }

    fn notice(&self, kind: NoticeKind, room: Option<&RoomCode>, message: String) {
        self.emit(SessionEvent::Notice(Notice {
            kind,
            room: room.cloned(),
            message,
        }));
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!(?event, "session event dropped: receiver is not keeping up");
        }
    }
}

impl<T: Transport, A: ChatApi> Drop for Session<T, A> {
    fn drop(&mut self) {
        self.supervisor.disconnect();
        self.stop_polling();
        for (_, preload) in self.preloads.drain() {
            preload.abort();
        }
        for fetch in self.fetches.drain().flat_map(|(_, fetches)| fetches) {
            fetch.abort();
        }
    }
}
