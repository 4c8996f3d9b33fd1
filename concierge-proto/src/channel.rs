//! Logical subscription channels and their destination paths.

use crate::message::RoomCode;

const ROOM_TOPIC_PREFIX: &str = "/topic/chat/";
const ROOM_LIST_TOPIC: &str = "/topic/rooms";
const UNREAD_QUEUE: &str = "/user/queue/unread";
const ERROR_QUEUE: &str = "/user/queue/errors";

/// A channel a session can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// All events for one room.
    Room(RoomCode),
    /// Room-list previews and handoff changes across rooms.
    RoomList,
    /// Per-user unread aggregates.
    Unread,
    /// Per-user rejections of actions.
    Errors,
}

impl Channel {
    /// The subscription destination for this channel.
    #[must_use]
    pub fn destination(&self) -> String {
        match self {
            Self::Room(code) => format!("{ROOM_TOPIC_PREFIX}{code}"),
            Self::RoomList => ROOM_LIST_TOPIC.to_string(),
            Self::Unread => UNREAD_QUEUE.to_string(),
            Self::Errors => ERROR_QUEUE.to_string(),
        }
    }

    /// Parse a subscription destination.
    #[must_use]
    pub fn parse(destination: &str) -> Option<Self> {
        match destination {
            ROOM_LIST_TOPIC => Some(Self::RoomList),
            UNREAD_QUEUE => Some(Self::Unread),
            ERROR_QUEUE => Some(Self::Errors),
            other => {
                let code = RoomCode::new(other.strip_prefix(ROOM_TOPIC_PREFIX)?);
                code.is_routable().then_some(Self::Room(code))
            }
        }
    }

    /// Whether this is a per-user queue rather than a shared topic.
    #[must_use]
    pub const fn is_user_queue(&self) -> bool {
        matches!(self, Self::Unread | Self::Errors)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.destination())
    }
}
