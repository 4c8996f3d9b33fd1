//! Server-pushed events carried in `MESSAGE` frame bodies.
//!
//! On the wire every event is a JSON object `{ "type", "payload", "roomState"? }`.
//! [`crate::codec`] turns that envelope into a typed [`ServerEvent`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, HandoffState, OperatorInfo, Party, RoomCode, Seq, Timestamp, UserId};

/// Discriminator of a server event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A new chat message.
    ChatMessage,
    /// An operator was assigned to or released from a room.
    AdminAssignment,
    /// A handoff state change.
    HandoffState,
    /// A system notice posted into a room.
    SystemMessage,
    /// A read cursor moved.
    ReadStatus,
    /// Room-list preview update.
    RoomPreview,
    /// Per-room unread aggregates.
    UnreadCounts,
    /// A server-side rejection addressed to this session.
    Error,
}

impl EventType {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessage => "CHAT_MESSAGE",
            Self::AdminAssignment => "ADMIN_ASSIGNMENT",
            Self::HandoffState => "HANDOFF_STATE",
            Self::SystemMessage => "SYSTEM_MESSAGE",
            Self::ReadStatus => "READ_STATUS",
            Self::RoomPreview => "ROOM_PREVIEW",
            Self::UnreadCounts => "UNREAD_COUNTS",
            Self::Error => "ERROR",
        }
    }

    /// Parse the wire spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CHAT_MESSAGE" => Self::ChatMessage,
            "ADMIN_ASSIGNMENT" => Self::AdminAssignment,
            "HANDOFF_STATE" => Self::HandoffState,
            "SYSTEM_MESSAGE" => Self::SystemMessage,
            "READ_STATUS" => Self::ReadStatus,
            "ROOM_PREVIEW" => Self::RoomPreview,
            "UNREAD_COUNTS" => Self::UnreadCounts,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }
}

/// Authoritative room state attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateUpdate {
    /// The state the room is now in.
    pub current: HandoffState,
    /// Assigned operator, when the state has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_info: Option<OperatorInfo>,
    /// Human-readable reason for the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_reason: Option<String>,
    /// Server time the state was established.
    pub timestamp: Timestamp,
}

/// Operator assignment change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAssignment {
    /// Affected room.
    pub room_code: RoomCode,
    /// Newly assigned operator, `None` when released.
    #[serde(default)]
    pub operator: Option<OperatorInfo>,
}

/// Payload of a `HANDOFF_STATE` event; the state itself rides in `roomState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffNotice {
    /// Affected room.
    pub room_code: RoomCode,
}

/// A read cursor moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatus {
    /// Affected room.
    pub room_code: RoomCode,
    /// Which side read.
    pub reader_role: Party,
    /// Highest sequence read. Absent means "everything currently delivered".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_seq: Option<Seq>,
    /// Reading user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<UserId>,
}

/// Room-list preview update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPreview {
    /// Affected room.
    pub room_code: RoomCode,
    /// Preview of the latest message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    /// Time of the latest message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<Timestamp>,
    /// Unread count for the recipient, if the server included one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

/// Per-room unread aggregates for the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    /// Unread count per room.
    pub counts: BTreeMap<RoomCode, u32>,
}

/// A server-side rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNotice {
    /// Room the rejected action targeted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_code: Option<RoomCode>,
    /// Machine-readable code, e.g. `PERMISSION_DENIED`.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Typed event body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    /// A new chat message.
    ChatMessage(ChatMessage),
    /// Operator assignment change.
    AdminAssignment(AdminAssignment),
    /// Handoff state change; see [`ServerEvent::room_state`].
    HandoffState(HandoffNotice),
    /// System notice posted into a room.
    SystemMessage(ChatMessage),
    /// Read cursor moved.
    ReadStatus(ReadStatus),
    /// Room-list preview.
    RoomPreview(RoomPreview),
    /// Unread aggregates.
    UnreadCounts(UnreadCounts),
    /// Server-side rejection.
    Error(ServerNotice),
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    /// The typed payload.
    pub body: EventBody,
    /// Authoritative room state, when the server attached one.
    pub room_state: Option<RoomStateUpdate>,
}

impl ServerEvent {
    /// An event without attached room state.
    #[must_use]
    pub const fn new(body: EventBody) -> Self {
        Self {
            body,
            room_state: None,
        }
    }

    /// Attach authoritative room state.
    #[must_use]
    pub fn with_room_state(mut self, state: RoomStateUpdate) -> Self {
        self.room_state = Some(state);
        self
    }

    /// The event discriminator.
    #[must_use]
    pub const fn kind(&self) -> EventType {
        match &self.body {
            EventBody::ChatMessage(_) => EventType::ChatMessage,
            EventBody::AdminAssignment(_) => EventType::AdminAssignment,
            EventBody::HandoffState(_) => EventType::HandoffState,
            EventBody::SystemMessage(_) => EventType::SystemMessage,
            EventBody::ReadStatus(_) => EventType::ReadStatus,
            EventBody::RoomPreview(_) => EventType::RoomPreview,
            EventBody::UnreadCounts(_) => EventType::UnreadCounts,
            EventBody::Error(_) => EventType::Error,
        }
    }

    /// The room this event concerns, if it concerns exactly one.
    #[must_use]
    pub const fn room_code(&self) -> Option<&RoomCode> {
        match &self.body {
            EventBody::ChatMessage(m) | EventBody::SystemMessage(m) => Some(&m.room_code),
            EventBody::AdminAssignment(a) => Some(&a.room_code),
            EventBody::HandoffState(h) => Some(&h.room_code),
            EventBody::ReadStatus(r) => Some(&r.room_code),
            EventBody::RoomPreview(p) => Some(&p.room_code),
            EventBody::Error(n) => n.room_code.as_ref(),
            EventBody::UnreadCounts(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_round_trip() {
        for kind in [
            EventType::ChatMessage,
            EventType::AdminAssignment,
            EventType::HandoffState,
            EventType::SystemMessage,
            EventType::ReadStatus,
            EventType::RoomPreview,
            EventType::UnreadCounts,
            EventType::Error,
        ] {
            assert_eq!(EventType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventType::parse("TYPING"), None);
    }

    #[test]
    fn room_code_of_unread_counts_is_none() {
        let event = ServerEvent::new(EventBody::UnreadCounts(UnreadCounts::default()));
        assert_eq!(event.room_code(), None);
        assert_eq!(event.kind(), EventType::UnreadCounts);
    }

    #[test]
    fn read_status_without_cursor_deserializes() {
        let status: ReadStatus =
            serde_json::from_str(r#"{"roomCode":"R1","readerRole":"STAFF"}"#).unwrap();
        assert_eq!(status.reader_role, Party::Staff);
        assert_eq!(status.last_read_seq, None);
    }
}
