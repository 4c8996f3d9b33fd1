//! Domain types shared by the client session and the broker.
//!
//! Field names serialize in camelCase to match the portal's JSON payloads.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum accepted message content length, in characters.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Short opaque code identifying a chat room (one per support conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Wraps a room code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Returns the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Room codes are embedded in destination paths, so they must be
    /// non-empty and free of `/`.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('/')
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server message id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an end user or staff member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-room monotonic sequence number assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self(millis)
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderType {
    /// The customer.
    EndUser,
    /// A human staff operator.
    Operator,
    /// The automated agent.
    Automated,
    /// A system notice (handoff announcements and the like).
    System,
}

impl SenderType {
    /// The read-receipt party a sender belongs to. System notices belong to
    /// neither side.
    #[must_use]
    pub const fn party(self) -> Option<Party> {
        match self {
            Self::EndUser => Some(Party::EndUser),
            Self::Operator | Self::Automated => Some(Party::Staff),
            Self::System => None,
        }
    }
}

/// One side of a conversation, for read-receipt purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Party {
    /// The customer side.
    EndUser,
    /// The support side (operators and the automated agent).
    Staff,
}

impl Party {
    /// The opposite party.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::EndUser => Self::Staff,
            Self::Staff => Self::EndUser,
        }
    }
}

/// The role a session participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// A customer.
    EndUser,
    /// A support operator.
    Operator,
}

impl Role {
    /// The read-receipt party of this role.
    #[must_use]
    pub const fn party(self) -> Party {
        match self {
            Self::EndUser => Party::EndUser,
            Self::Operator => Party::Staff,
        }
    }

    /// Sender type stamped on messages authored in this role.
    #[must_use]
    pub const fn sender_type(self) -> SenderType {
        match self {
            Self::EndUser => SenderType::EndUser,
            Self::Operator => SenderType::Operator,
        }
    }

    /// Wire spelling, as used in handshake headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndUser => "END_USER",
            Self::Operator => "OPERATOR",
        }
    }

    /// Parse the wire spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "END_USER" => Some(Self::EndUser),
            "OPERATOR" => Some(Self::Operator),
            _ => None,
        }
    }
}

/// Who is currently responsible for responding in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffState {
    /// The automated agent answers.
    #[default]
    AutomatedActive,
    /// The end user asked for a human and nobody has picked it up yet.
    WaitingForOperator,
    /// A human operator owns the conversation.
    OperatorActive,
}

impl HandoffState {
    /// Whether moving from `self` to `next` is a permitted transition.
    ///
    /// Staying in the same state is always permitted. The only forbidden
    /// move is from `OperatorActive` back to `WaitingForOperator`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !matches!(
            (self, next),
            (Self::OperatorActive, Self::WaitingForOperator)
        )
    }
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AutomatedActive => "AUTOMATED_ACTIVE",
            Self::WaitingForOperator => "WAITING_FOR_OPERATOR",
            Self::OperatorActive => "OPERATOR_ACTIVE",
        })
    }
}

/// Metadata about the operator assigned to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorInfo {
    /// Operator user id.
    pub id: UserId,
    /// Name shown to the end user.
    pub display_name: String,
    /// Last time the operator did something in the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<Timestamp>,
}

/// A confirmed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Room the message belongs to.
    pub room_code: RoomCode,
    /// Per-room order.
    pub seq: Seq,
    /// Author.
    pub sender_id: UserId,
    /// Author kind.
    pub sender_type: SenderType,
    /// Text content.
    pub content: String,
    /// Server timestamp.
    pub sent_at: Timestamp,
    /// Number of recipients that have not read the message (0 or 1 here).
    #[serde(default)]
    pub unread_count: u32,
    /// Client correlation id echoed back from the originating send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// One row of the room list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Room code.
    pub room_code: RoomCode,
    /// Current handoff state.
    #[serde(default)]
    pub handoff_state: HandoffState,
    /// Assigned operator, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorInfo>,
    /// Preview of the latest message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    /// Time of the latest message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<Timestamp>,
    /// Unread messages for the caller.
    #[serde(default)]
    pub unread_count: u32,
}

/// A page of history, as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Messages in any order; clients sort by sequence.
    pub items: Vec<ChatMessage>,
    /// Server hint that no older page exists.
    #[serde(default)]
    pub is_last_page: bool,
}

/// Rejections for outgoing message content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    /// Content was empty or only whitespace.
    #[error("message content is empty")]
    Empty,

    /// Content exceeded [`MAX_CONTENT_LEN`].
    #[error("message content is {len} characters (max {max})")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },
}

/// Check outgoing content before it is sent or shown optimistically.
///
/// # Errors
///
/// Returns [`ContentError`] if the content is blank or too long.
pub fn validate_content(content: &str) -> Result<(), ContentError> {
    if content.trim().is_empty() {
        return Err(ContentError::Empty);
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_LEN {
        return Err(ContentError::TooLong {
            len,
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}
