//! In-memory chat broker: tickets, rooms, connections and fan-out.
//!
//! The broker owns every room's history, handoff state and read cursors,
//! and applies client actions with the same guards the portal enforces:
//! operators may not post while the automated agent is active or while
//! another operator owns the room, handoff transitions must start from the
//! right state and come from the right role, and end users only see their
//! own rooms. Rejections go back to the acting connection as `ERROR` events
//! on its errors queue.
//!
//! All methods are synchronous; the WebSocket and HTTP layers in
//! [`crate::server`] call in from their tasks.

use std::collections::{BTreeMap, HashMap};

use concierge_proto::action::ClientAction;
use concierge_proto::channel::Channel;
use concierge_proto::codec;
use concierge_proto::event::{
    AdminAssignment, EventBody, HandoffNotice, ReadStatus, RoomPreview, RoomStateUpdate,
    ServerEvent, ServerNotice, UnreadCounts,
};
use concierge_proto::frame::{Command, Frame, headers};
use concierge_proto::message::{
    ChatMessage, HandoffState, MessageId, MessagePage, OperatorInfo, Party, Role, RoomCode,
    RoomSummary, SenderType, Seq, Timestamp, UserId, validate_content,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Error code: the caller's role or ownership does not allow the action.
pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
/// Error code: the room is not in the state the action starts from.
pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
/// Error code: message content was rejected.
pub const INVALID_CONTENT: &str = "INVALID_CONTENT";
/// Error code: the room does not exist.
pub const UNKNOWN_ROOM: &str = "UNKNOWN_ROOM";
/// Error code: the frame could not be understood.
pub const BAD_REQUEST: &str = "BAD_REQUEST";

const PREVIEW_CHARS: usize = 80;

/// Identifies one attached WebSocket connection.
pub type ConnectionId = u64;

/// Who a ticket or credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id.
    pub user_id: UserId,
    /// Role the user acts in.
    pub role: Role,
    /// Name shown to the other side.
    pub display_name: String,
}

impl Identity {
    /// An identity whose display name is its user id.
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        let user_id = UserId::new(user_id);
        Self {
            display_name: user_id.to_string(),
            user_id,
            role,
        }
    }

    /// Override the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Parse a bearer credential of the form `ROLE:user-id`.
    #[must_use]
    pub fn from_credential(credential: &str) -> Option<Self> {
        let (role, user) = credential.split_once(':')?;
        let role = Role::parse(role)?;
        if user.is_empty() {
            return None;
        }
        Some(Self::new(user, role))
    }

    /// The bearer credential for this identity.
    #[must_use]
    pub fn credential(&self) -> String {
        format!("{}:{}", self.role.as_str(), self.user_id)
    }

    fn operator_info(&self, at: Timestamp) -> OperatorInfo {
        OperatorInfo {
            id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            last_activity_at: Some(at),
        }
    }
}

/// Errors from the broker's request/response operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The ticket was never issued or has been used.
    #[error("unknown or already used ticket")]
    InvalidTicket,

    /// No such room.
    #[error("unknown room {0}")]
    UnknownRoom(RoomCode),

    /// The caller may not see the room.
    #[error("{user} may not access room {room}")]
    Forbidden {
        /// The caller.
        user: UserId,
        /// The room.
        room: RoomCode,
    },
}

struct RoomRecord {
    owner: UserId,
    state: HandoffState,
    operator: Option<OperatorInfo>,
    messages: Vec<ChatMessage>,
    cursors: HashMap<Party, Seq>,
}

impl RoomRecord {
    fn new(owner: UserId) -> Self {
        Self {
            owner,
            state: HandoffState::AutomatedActive,
            operator: None,
            messages: Vec::new(),
            cursors: HashMap::new(),
        }
    }

    fn can_access(&self, identity: &Identity) -> bool {
        identity.role == Role::Operator || self.owner == identity.user_id
    }

    fn cursor(&self, party: Party) -> Seq {
        self.cursors.get(&party).copied().unwrap_or(Seq::new(0))
    }

    fn max_seq(&self) -> Seq {
        self.messages.last().map_or(Seq::new(0), |m| m.seq)
    }

    fn next_seq(&self) -> Seq {
        self.max_seq().next()
    }

    /// A copy of `message` with its unread marker from the recipient's cursor.
    fn marked(&self, message: &ChatMessage) -> ChatMessage {
        let unread = message
            .sender_type
            .party()
            .is_some_and(|author| message.seq > self.cursor(author.other()));
        ChatMessage {
            unread_count: u32::from(unread),
            ..message.clone()
        }
    }

    /// Messages `party` has not read.
    fn unread_for(&self, party: Party) -> u32 {
        let cursor = self.cursor(party);
        let count = self
            .messages
            .iter()
            .filter(|m| m.sender_type.party() == Some(party.other()) && m.seq > cursor)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn summary(&self, code: &RoomCode, party: Party) -> RoomSummary {
        let last = self.messages.last();
        RoomSummary {
            room_code: code.clone(),
            handoff_state: self.state,
            operator: self.operator.clone(),
            last_message_preview: last.map(|m| preview(&m.content)),
            last_message_at: last.map(|m| m.sent_at),
            unread_count: self.unread_for(party),
        }
    }
}

fn preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

struct Connection {
    identity: Identity,
    tx: mpsc::UnboundedSender<Frame>,
    subscriptions: HashMap<String, Channel>,
}

impl Connection {
    fn is_subscribed(&self, channel: &Channel) -> bool {
        self.subscriptions.values().any(|c| c == channel)
    }

    fn deliver(&self, channel: &Channel, body: &str, counter: &mut u64) {
        let destination = channel.destination();
        for (id, subscribed) in &self.subscriptions {
            if subscribed == channel {
                *counter += 1;
                let frame = Frame::message(id, &destination, &format!("d-{counter}"), body);
                if self.tx.send(frame).is_err() {
                    tracing::debug!(user = %self.identity.user_id, "delivery to closed connection");
                }
            }
        }
    }
}

#[derive(Default)]
struct State {
    tickets: HashMap<String, Identity>,
    rooms: BTreeMap<RoomCode, RoomRecord>,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    deliveries: u64,
    last_stamp: u64,
}

fn encode(event: &ServerEvent) -> Option<String> {
    codec::encode_event(event)
        .map_err(|e| tracing::error!(err = %e, "failed to encode event"))
        .ok()
}

impl State {
    /// Strictly increasing server time.
    fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis().max(self.last_stamp + 1);
        self.last_stamp = now;
        Timestamp::from_millis(now)
    }

    fn push_to(&mut self, id: ConnectionId, channel: &Channel, event: &ServerEvent) {
        let Some(body) = encode(event) else {
            return;
        };
        if let Some(conn) = self.connections.get(&id) {
            conn.deliver(channel, &body, &mut self.deliveries);
        }
    }

    /// Deliver `event` on `channel` to every connection allowed into `room`.
    fn broadcast(&mut self, room: &RoomCode, channel: &Channel, event: &ServerEvent) {
        let Some(body) = encode(event) else {
            return;
        };
        let Some(record) = self.rooms.get(room) else {
            return;
        };
        for conn in self.connections.values() {
            if record.can_access(&conn.identity) {
                conn.deliver(channel, &body, &mut self.deliveries);
            }
        }
    }

    fn reject(&mut self, id: ConnectionId, room: Option<&RoomCode>, code: &str, message: String) {
        tracing::debug!(connection = id, code, %message, "action rejected");
        let notice = ServerNotice {
            room_code: room.cloned(),
            code: code.to_string(),
            message,
        };
        self.push_to(id, &Channel::Errors, &ServerEvent::new(EventBody::Error(notice)));
    }

    fn unread_counts(&self, identity: &Identity) -> BTreeMap<RoomCode, u32> {
        let party = identity.role.party();
        self.rooms
            .iter()
            .filter(|(_, r)| r.can_access(identity))
            .map(|(code, r)| (code.clone(), r.unread_for(party)))
            .collect()
    }

    fn push_unread_to(&mut self, id: ConnectionId) {
        let Some(identity) = self.connections.get(&id).map(|c| c.identity.clone()) else {
            return;
        };
        let counts = self.unread_counts(&identity);
        let event = ServerEvent::new(EventBody::UnreadCounts(UnreadCounts { counts }));
        self.push_to(id, &Channel::Unread, &event);
    }

    /// Refresh unread aggregates for everyone who can see `room`.
    fn push_unread(&mut self, room: &RoomCode) {
        let Some(record) = self.rooms.get(room) else {
            return;
        };
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_subscribed(&Channel::Unread) && record.can_access(&c.identity))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.push_unread_to(id);
        }
    }

    /// Send each viewer of `room` a room-list preview with their own count.
    fn push_preview(&mut self, room: &RoomCode) {
        let Some(record) = self.rooms.get(room) else {
            return;
        };
        let last = record.messages.last();
        for conn in self.connections.values() {
            if !record.can_access(&conn.identity) || !conn.is_subscribed(&Channel::RoomList) {
                continue;
            }
            let event = ServerEvent::new(EventBody::RoomPreview(RoomPreview {
                room_code: room.clone(),
                last_message_preview: last.map(|m| preview(&m.content)),
                last_message_at: last.map(|m| m.sent_at),
                unread_count: Some(record.unread_for(conn.identity.role.party())),
            }));
            if let Some(body) = encode(&event) {
                conn.deliver(&Channel::RoomList, &body, &mut self.deliveries);
            }
        }
    }

    /// Look up a room for `identity`, creating it when an end user opens a
    /// room of their own for the first time.
    fn open_room(&mut self, identity: &Identity, room: &RoomCode) -> Result<(), (&'static str, String)> {
        match self.rooms.get(room) {
            Some(record) if record.can_access(identity) => Ok(()),
            Some(_) => Err((PERMISSION_DENIED, format!("room {room} belongs to another user"))),
            None if identity.role == Role::EndUser => {
                tracing::info!(room = %room, owner = %identity.user_id, "room created");
                self.rooms
                    .insert(room.clone(), RoomRecord::new(identity.user_id.clone()));
                Ok(())
            }
            None => Err((UNKNOWN_ROOM, format!("unknown room {room}"))),
        }
    }

    fn append(
        &mut self,
        room: &RoomCode,
        sender: (UserId, SenderType),
        content: String,
        client_ref: Option<String>,
    ) -> Option<ChatMessage> {
        let sent_at = self.stamp();
        let record = self.rooms.get_mut(room)?;
        let seq = record.next_seq();
        let (sender_id, sender_type) = sender;
        let message = ChatMessage {
            id: MessageId::new(format!("{room}-{seq}")),
            room_code: room.clone(),
            seq,
            sender_id,
            sender_type,
            content,
            sent_at,
            unread_count: 0,
            client_ref,
        };
        record.messages.push(message.clone());
        let marked = record.marked(&message);
        tracing::debug!(room = %room, seq = %seq, sender = %marked.sender_id, "message stored");

        let body = if sender_type == SenderType::System {
            EventBody::SystemMessage(marked.clone())
        } else {
            EventBody::ChatMessage(marked.clone())
        };
        self.broadcast(room, &Channel::Room(room.clone()), &ServerEvent::new(body));
        self.push_preview(room);
        self.push_unread(room);
        Some(marked)
    }

    fn on_subscribe(&mut self, id: ConnectionId, identity: &Identity, frame: &Frame) {
        let (Some(sub_id), Some(destination)) = (frame.header(headers::ID), frame.destination()) else {
            self.reject(id, None, BAD_REQUEST, "SUBSCRIBE needs id and destination".into());
            return;
        };
        let Some(channel) = Channel::parse(destination) else {
            self.reject(id, None, BAD_REQUEST, format!("unknown destination {destination}"));
            return;
        };
        if let Channel::Room(room) = &channel {
            if let Err((code, message)) = self.open_room(identity, room) {
                self.reject(id, Some(room), code, message);
                return;
            }
        }
        tracing::debug!(connection = id, %channel, sub_id, "subscribed");
        let sub_id = sub_id.to_string();
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.subscriptions.insert(sub_id, channel);
        }
    }

    fn on_send(&mut self, id: ConnectionId, identity: &Identity, frame: &Frame) {
        let action = match frame
            .destination()
            .ok_or_else(|| "SEND without destination".to_string())
            .and_then(|d| ClientAction::parse(d, &frame.body).map_err(|e| e.to_string()))
        {
            Ok(action) => action,
            Err(message) => {
                self.reject(id, None, BAD_REQUEST, message);
                return;
            }
        };

        if let Some(room) = action.room_code() {
            if let Err((code, message)) = self.open_room(identity, room) {
                self.reject(id, Some(room), code, message);
                return;
            }
        }

        match action {
            ClientAction::JoinRoom { room_code } => {
                tracing::info!(room = %room_code, user = %identity.user_id, "joined room");
            }
            ClientAction::SendMessage {
                room_code,
                content,
                client_ref,
            } => self.on_chat(id, identity, &room_code, content, client_ref),
            ClientAction::MarkRead {
                room_code,
                last_read_seq,
            } => self.read(identity, &room_code, last_read_seq),
            ClientAction::RequestUnreadCount => self.push_unread_to(id),
            transition => self.on_transition(id, identity, &transition),
        }
    }

    fn on_chat(
        &mut self,
        id: ConnectionId,
        identity: &Identity,
        room: &RoomCode,
        content: String,
        client_ref: Option<String>,
    ) {
        if let Err(e) = validate_content(&content) {
            self.reject(id, Some(room), INVALID_CONTENT, e.to_string());
            return;
        }
        let Some(record) = self.rooms.get(room) else {
            return;
        };
        if identity.role == Role::Operator {
            if record.state == HandoffState::AutomatedActive {
                self.reject(
                    id,
                    Some(room),
                    PERMISSION_DENIED,
                    "the automated agent is handling this room".into(),
                );
                return;
            }
            if let Some(owner) = record.operator.as_ref().filter(|o| o.id != identity.user_id) {
                let message = format!("room is assigned to {}", owner.display_name);
                self.reject(id, Some(room), PERMISSION_DENIED, message);
                return;
            }
        }
        let sender = (identity.user_id.clone(), identity.role.sender_type());
        self.append(room, sender, content, client_ref);
    }

    fn on_transition(&mut self, id: ConnectionId, identity: &Identity, action: &ClientAction) {
        let (room, required_role, from, to, reason) = match action {
            ClientAction::RequestHandoff { room_code } => (
                room_code,
                Some(Role::EndUser),
                HandoffState::AutomatedActive,
                HandoffState::WaitingForOperator,
                "The customer asked for an operator".to_string(),
            ),
            ClientAction::CancelHandoff { room_code } => (
                room_code,
                Some(Role::EndUser),
                HandoffState::WaitingForOperator,
                HandoffState::AutomatedActive,
                "The customer withdrew the request".to_string(),
            ),
            ClientAction::RequestAutomatedReturn { room_code } => (
                room_code,
                None,
                HandoffState::OperatorActive,
                HandoffState::AutomatedActive,
                "The automated agent is back".to_string(),
            ),
            ClientAction::Intervene { room_code } => (
                room_code,
                Some(Role::Operator),
                HandoffState::AutomatedActive,
                HandoffState::OperatorActive,
                format!("{} joined the conversation", identity.display_name),
            ),
            ClientAction::AcceptHandoff { room_code } => (
                room_code,
                Some(Role::Operator),
                HandoffState::WaitingForOperator,
                HandoffState::OperatorActive,
                format!("{} joined the conversation", identity.display_name),
            ),
            other => {
                tracing::warn!(destination = %other.destination(), "not a handoff action");
                return;
            }
        };
        let Some(record) = self.rooms.get(room) else {
            return;
        };

        if required_role.is_some_and(|r| r != identity.role) {
            let message = format!("{} may not {}", identity.role.as_str(), action.destination());
            self.reject(id, Some(room), PERMISSION_DENIED, message);
            return;
        }
        if record.state != from || !record.state.can_transition_to(to) {
            let message = format!("room is {}, not {from}", record.state);
            self.reject(id, Some(room), INVALID_TRANSITION, message);
            return;
        }
        let assigned_elsewhere = identity.role == Role::Operator
            && record
                .operator
                .as_ref()
                .is_some_and(|o| o.id != identity.user_id);
        if assigned_elsewhere {
            self.reject(id, Some(room), PERMISSION_DENIED, "room is assigned to another operator".into());
            return;
        }

        let at = self.stamp();
        let operator = (to == HandoffState::OperatorActive).then(|| identity.operator_info(at));
        let Some(record) = self.rooms.get_mut(room) else {
            return;
        };
        record.state = to;
        let reassigned = record.operator.as_ref().map(|o| &o.id) != operator.as_ref().map(|o| &o.id);
        record.operator.clone_from(&operator);
        tracing::info!(room = %room, %from, %to, by = %identity.user_id, "handoff transition");

        let update = RoomStateUpdate {
            current: to,
            admin_info: operator.clone(),
            transition_reason: Some(reason.clone()),
            timestamp: at,
        };
        let event = ServerEvent::new(EventBody::HandoffState(HandoffNotice {
            room_code: room.clone(),
        }))
        .with_room_state(update);
        self.broadcast(room, &Channel::Room(room.clone()), &event);
        self.broadcast(room, &Channel::RoomList, &event);
        if reassigned {
            let assignment = ServerEvent::new(EventBody::AdminAssignment(AdminAssignment {
                room_code: room.clone(),
                operator,
            }));
            self.broadcast(room, &Channel::Room(room.clone()), &assignment);
        }
        self.append(room, (UserId::new("system"), SenderType::System), reason, None);
    }

    /// Advance `identity`'s party cursor and tell the room.
    fn read(&mut self, identity: &Identity, room: &RoomCode, last_read_seq: Seq) {
        let party = identity.role.party();
        let Some(record) = self.rooms.get_mut(room) else {
            return;
        };
        let cursor = last_read_seq.min(record.max_seq());
        if cursor <= record.cursor(party) {
            return;
        }
        record.cursors.insert(party, cursor);
        tracing::debug!(room = %room, ?party, cursor = %cursor, "read cursor advanced");

        let status = ReadStatus {
            room_code: room.clone(),
            reader_role: party,
            last_read_seq: Some(cursor),
            reader_id: Some(identity.user_id.clone()),
        };
        self.broadcast(room, &Channel::Room(room.clone()), &ServerEvent::new(EventBody::ReadStatus(status)));
        self.push_preview(room);
        self.push_unread(room);
    }
}

/// The broker. Share it behind an `Arc`.
#[derive(Default)]
pub struct Broker {
    state: Mutex<State>,
}

impl Broker {
    /// An empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- tickets --------------------------------------------------------

    /// Issue a single-use connection ticket for `identity`.
    pub fn issue_ticket(&self, identity: Identity) -> String {
        let ticket = uuid::Uuid::now_v7().to_string();
        tracing::debug!(user = %identity.user_id, "ticket issued");
        self.state.lock().tickets.insert(ticket.clone(), identity);
        ticket
    }

    /// Redeem a ticket. Each ticket works once.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidTicket`] for unknown or spent tickets.
    pub fn redeem(&self, ticket: &str) -> Result<Identity, BrokerError> {
        self.state
            .lock()
            .tickets
            .remove(ticket)
            .ok_or(BrokerError::InvalidTicket)
    }

    // -- connections ----------------------------------------------------

    /// Attach a connection. Frames for it arrive on the returned receiver.
    pub fn attach(&self, identity: Identity) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        tracing::info!(connection = id, user = %identity.user_id, role = identity.role.as_str(), "connection attached");
        state.connections.insert(
            id,
            Connection {
                identity,
                tx,
                subscriptions: HashMap::new(),
            },
        );
        (id, rx)
    }

    /// Detach a connection. Returns `false` if it was already gone.
    pub fn detach(&self, id: ConnectionId) -> bool {
        let removed = self.state.lock().connections.remove(&id).is_some();
        if removed {
            tracing::info!(connection = id, "connection detached");
        }
        removed
    }

    /// Drop every connection; their sockets close. Returns how many.
    pub fn kick_all(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.connections.len();
        state.connections.clear();
        tracing::info!(count, "dropped all connections");
        count
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Apply a frame from connection `id`.
    pub fn handle_frame(&self, id: ConnectionId, frame: &Frame) {
        let mut state = self.state.lock();
        let Some(identity) = state.connections.get(&id).map(|c| c.identity.clone()) else {
            return;
        };
        match frame.command {
            Command::Subscribe => state.on_subscribe(id, &identity, frame),
            Command::Unsubscribe => {
                if let (Some(sub_id), Some(conn)) =
                    (frame.header(headers::ID), state.connections.get_mut(&id))
                {
                    conn.subscriptions.remove(sub_id);
                }
            }
            Command::Send => state.on_send(id, &identity, frame),
            Command::Disconnect => {
                state.connections.remove(&id);
                tracing::info!(connection = id, "client disconnected");
            }
            other => tracing::debug!(connection = id, command = other.as_str(), "ignoring frame"),
        }
    }

    // -- rooms ----------------------------------------------------------

    /// Create a room owned by `owner`. Returns `false` if it exists.
    pub fn create_room(&self, room: &RoomCode, owner: &UserId) -> bool {
        let mut state = self.state.lock();
        if state.rooms.contains_key(room) {
            return false;
        }
        state.rooms.insert(room.clone(), RoomRecord::new(owner.clone()));
        true
    }

    /// Post a reply from the automated agent.
    pub fn post_agent_message(&self, room: &RoomCode, content: &str) -> Option<ChatMessage> {
        self.state.lock().append(
            room,
            (UserId::new("agent"), SenderType::Automated),
            content.to_string(),
            None,
        )
    }

    /// A room's handoff state.
    #[must_use]
    pub fn room_state(&self, room: &RoomCode) -> Option<HandoffState> {
        self.state.lock().rooms.get(room).map(|r| r.state)
    }

    /// A room's full history with current unread markers.
    #[must_use]
    pub fn messages(&self, room: &RoomCode) -> Vec<ChatMessage> {
        let state = self.state.lock();
        state
            .rooms
            .get(room)
            .map(|r| r.messages.iter().map(|m| r.marked(m)).collect())
            .unwrap_or_default()
    }

    // -- request/response -----------------------------------------------

    /// Rooms `identity` can see.
    #[must_use]
    pub fn room_summaries(&self, identity: &Identity) -> Vec<RoomSummary> {
        let state = self.state.lock();
        let party = identity.role.party();
        state
            .rooms
            .iter()
            .filter(|(_, r)| r.can_access(identity))
            .map(|(code, r)| r.summary(code, party))
            .collect()
    }

    /// Page `page_index` of a room's history, newest first.
    ///
    /// # Errors
    ///
    /// [`BrokerError::UnknownRoom`] or [`BrokerError::Forbidden`].
    pub fn history_page(
        &self,
        identity: &Identity,
        room: &RoomCode,
        page_index: u32,
        page_size: u32,
    ) -> Result<MessagePage, BrokerError> {
        let state = self.state.lock();
        let record = Self::visible(&state, identity, room)?;
        let size = page_size as usize;
        let offset = page_index as usize * size;
        let items = record
            .messages
            .iter()
            .rev()
            .skip(offset)
            .take(size)
            .map(|m| record.marked(m))
            .collect();
        Ok(MessagePage {
            items,
            is_last_page: offset + size >= record.messages.len(),
        })
    }

    /// Record that `identity` has read `room` up to `last_read_seq`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::UnknownRoom`] or [`BrokerError::Forbidden`].
    pub fn mark_read(&self, identity: &Identity, room: &RoomCode, last_read_seq: Seq) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        Self::visible(&state, identity, room)?;
        state.read(identity, room, last_read_seq);
        Ok(())
    }

    /// Unread aggregates for `identity`.
    #[must_use]
    pub fn unread_counts(&self, identity: &Identity) -> BTreeMap<RoomCode, u32> {
        self.state.lock().unread_counts(identity)
    }

    fn visible<'a>(state: &'a State, identity: &Identity, room: &RoomCode) -> Result<&'a RoomRecord, BrokerError> {
        let record = state
            .rooms
            .get(room)
            .ok_or_else(|| BrokerError::UnknownRoom(room.clone()))?;
        if record.can_access(identity) {
            Ok(record)
        } else {
            Err(BrokerError::Forbidden {
                user: identity.user_id.clone(),
                room: room.clone(),
            })
        }
    }
}
