//! Unread aggregates and the delivery mode.
//!
//! Aggregates arrive three ways: pushed on the live unread queue, fetched by
//! the fallback poller, or taken from a REST snapshot (room-list refresh).
//! The delivery mode decides which source is current. Live updates are
//! ignored while polling and poll results are ignored once the socket is
//! back, so the two can never fight over the same counters.

use std::collections::BTreeMap;

use concierge_proto::message::RoomCode;

/// How the session currently receives updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Over the live socket.
    Live,
    /// By periodic REST polling after reconnect gave up.
    Polling,
    /// Neither: not connected yet, or reconnecting.
    #[default]
    Offline,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Polling => "polling",
            Self::Offline => "offline",
        })
    }
}

/// Where an aggregate update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadSource {
    /// The live unread queue or a room preview.
    Live,
    /// The fallback poller.
    Polling,
    /// A REST snapshot requested by the session.
    Snapshot,
}

/// Per-room unread aggregates.
#[derive(Debug, Default)]
pub struct UnreadTracker {
    mode: DeliveryMode,
    counts: BTreeMap<RoomCode, u32>,
}

impl UnreadTracker {
    /// Create an empty tracker in [`DeliveryMode::Offline`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current delivery mode.
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Switch delivery mode. Returns `true` if it changed.
    pub fn set_mode(&mut self, mode: DeliveryMode) -> bool {
        if self.mode == mode {
            return false;
        }
        tracing::info!(from = %self.mode, to = %mode, "delivery mode changed");
        self.mode = mode;
        true
    }

    fn accepts(&self, source: UnreadSource) -> bool {
        match source {
            UnreadSource::Snapshot => true,
            UnreadSource::Live => self.mode == DeliveryMode::Live,
            UnreadSource::Polling => self.mode == DeliveryMode::Polling,
        }
    }

    /// Merge aggregates from `source`. Returns `true` if anything changed;
    /// updates from a source that is not current are dropped.
    pub fn apply(&mut self, source: UnreadSource, counts: &BTreeMap<RoomCode, u32>) -> bool {
        if !self.accepts(source) {
            tracing::debug!(?source, mode = %self.mode, "dropping unread update from inactive source");
            return false;
        }
        let mut changed = false;
        for (room, count) in counts {
            if self.counts.insert(room.clone(), *count) != Some(*count) {
                changed = true;
            }
        }
        changed
    }

    /// Set one room's aggregate from `source`.
    pub fn set(&mut self, source: UnreadSource, room: &RoomCode, count: u32) -> bool {
        if !self.accepts(source) {
            return false;
        }
        self.counts.insert(room.clone(), count) != Some(count)
    }

    /// Zero a room after the caller read it. Always applies.
    pub fn clear(&mut self, room: &RoomCode) -> bool {
        self.counts.insert(room.clone(), 0).is_some_and(|old| old != 0)
    }

    /// One room's aggregate.
    #[must_use]
    pub fn get(&self, room: &RoomCode) -> u32 {
        self.counts.get(room).copied().unwrap_or(0)
    }

    /// Sum over all rooms.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.counts.values().fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    /// All aggregates.
    #[must_use]
    pub const fn counts(&self) -> &BTreeMap<RoomCode, u32> {
        &self.counts
    }

    /// Forget a room.
    pub fn forget(&mut self, room: &RoomCode) {
        self.counts.remove(room);
    }
}
