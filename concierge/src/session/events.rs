//! Events a [`Session`](super::Session) reports to its host.

use concierge_proto::message::{HandoffState, MessageId, Party, RoomCode, Seq};

use crate::room::RoomError;
use crate::stream::{ScrollAnchor, TempId};
use crate::transport::TransportType;
use crate::unread::DeliveryMode;

/// Category of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// The caller may not do that.
    Permission,
    /// The request or content was invalid.
    Validation,
    /// Connectivity changed in a way the user should know about.
    Connection,
    /// Messages were not delivered.
    Delivery,
}

impl NoticeKind {
    /// Kind for a server error code.
    #[must_use]
    pub fn for_code(code: &str) -> Self {
        match code {
            "PERMISSION_DENIED" | "FORBIDDEN" | "NOT_ASSIGNED" => Self::Permission,
            _ => Self::Validation,
        }
    }

    /// Kind for a local room rejection.
    #[must_use]
    pub const fn for_room_error(err: &RoomError) -> Self {
        if err.is_permission() {
            Self::Permission
        } else {
            Self::Validation
        }
    }
}

/// A transient, dismissible message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Category.
    pub kind: NoticeKind,
    /// Room the notice concerns, if any.
    pub room: Option<RoomCode>,
    /// Human-readable text.
    pub message: String,
}

/// Something the host may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The realtime link went up or down.
    ConnectionChanged {
        /// Whether it is up now.
        connected: bool,
        /// Transport carrying the link, when up.
        transport: Option<TransportType>,
    },
    /// Updates now arrive a different way.
    DeliveryModeChanged {
        /// The new mode.
        mode: DeliveryMode,
    },
    /// The room list was replaced from a snapshot.
    RoomsRefreshed {
        /// Rooms in the snapshot.
        rooms: Vec<RoomCode>,
    },
    /// A room's summary changed (preview, operator, unread aggregate).
    RoomUpdated {
        /// The room.
        room: RoomCode,
    },
    /// A room's handoff state changed.
    HandoffChanged {
        /// The room.
        room: RoomCode,
        /// State before.
        from: HandoffState,
        /// State after.
        to: HandoffState,
        /// Reason given by the server.
        reason: Option<String>,
    },
    /// A room started waiting for an operator.
    AttentionRaised {
        /// The room.
        room: RoomCode,
    },
    /// A room stopped waiting for an operator.
    AttentionCleared {
        /// The room.
        room: RoomCode,
    },
    /// The initial page of a room was loaded.
    MessagesLoaded {
        /// The room.
        room: RoomCode,
        /// Messages now in the stream.
        count: usize,
        /// Whether older history may exist.
        has_more: bool,
    },
    /// Older messages were prepended.
    MessagesPrepended {
        /// The room.
        room: RoomCode,
        /// Messages added.
        added: usize,
        /// Whether more history may exist.
        has_more: bool,
        /// Restore the scroll position from this once rendered.
        anchor: Option<ScrollAnchor>,
    },
    /// A live message was added at the end.
    MessageAppended {
        /// The room.
        room: RoomCode,
        /// The message.
        id: MessageId,
        /// Whether the view should scroll to it.
        autoscroll: bool,
    },
    /// A late message was inserted before the end.
    MessageInserted {
        /// The room.
        room: RoomCode,
        /// The message.
        id: MessageId,
        /// Its position among confirmed messages.
        index: usize,
    },
    /// An optimistic entry was added for an outgoing message.
    MessagePending {
        /// The room.
        room: RoomCode,
        /// Temporary id.
        temp_id: TempId,
    },
    /// The server confirmed a pending send.
    MessageConfirmed {
        /// The room.
        room: RoomCode,
        /// Temporary id that was replaced.
        temp_id: TempId,
        /// Confirmed id.
        id: MessageId,
        /// Whether the view should scroll to it.
        autoscroll: bool,
    },
    /// A pending send failed; it can be retried or discarded.
    SendFailed {
        /// The room.
        room: RoomCode,
        /// Temporary id.
        temp_id: TempId,
        /// Why.
        reason: String,
    },
    /// A background refetch corrected the stream.
    MessagesReconciled {
        /// The room.
        room: RoomCode,
        /// Messages that were missing.
        added: usize,
        /// Messages whose unread marker changed.
        updated: usize,
    },
    /// Unread markers were cleared on some messages.
    UnreadMarkersCleared {
        /// The room.
        room: RoomCode,
        /// Whose messages.
        party: Party,
        /// Cursor applied.
        up_to: Seq,
        /// Messages that changed.
        ids: Vec<MessageId>,
    },
    /// Unread aggregates changed.
    UnreadCountsChanged {
        /// Sum over all rooms.
        total: u32,
    },
    /// Something the user should see.
    Notice(Notice),
}
