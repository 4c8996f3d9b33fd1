//! Read cursors and reconciliation pacing.
//!
//! Each side of a room has a read cursor: the highest `seq` it has read.
//! Cursors only move forward. After the session updates unread markers
//! optimistically it refetches the latest page to pick up the server's
//! view, at most once per room per interval. A refetch asked for too soon is
//! owed and handed out once the interval has passed.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use concierge_proto::message::{Party, RoomCode, Seq};
use tokio::time::Instant;

/// Highest read `seq` per room and party.
#[derive(Debug, Default)]
pub struct ReadCursors {
    cursors: HashMap<(RoomCode, Party), Seq>,
}

impl ReadCursors {
    /// Create empty cursors.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `party`'s cursor in `room` to `seq`. Returns `false` (and leaves
    /// the cursor alone) if that would move it backwards or not at all.
    pub fn advance(&mut self, room: &RoomCode, party: Party, seq: Seq) -> bool {
        let cursor = self.cursors.entry((room.clone(), party)).or_insert(Seq::new(0));
        if seq > *cursor {
            *cursor = seq;
            true
        } else {
            false
        }
    }

    /// `party`'s cursor in `room`.
    #[must_use]
    pub fn get(&self, room: &RoomCode, party: Party) -> Option<Seq> {
        self.cursors.get(&(room.clone(), party)).copied()
    }

    /// Forget a room's cursors.
    pub fn forget(&mut self, room: &RoomCode) {
        self.cursors.retain(|(r, _), _| r != room);
    }
}

/// Allows one reconciliation refetch per room per interval.
#[derive(Debug)]
pub struct ReconcileLimiter {
    interval: Duration,
    last: HashMap<RoomCode, Instant>,
    owed: BTreeSet<RoomCode>,
}

impl ReconcileLimiter {
    /// A limiter with the given minimum spacing.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
            owed: BTreeSet::new(),
        }
    }

    /// Whether a refetch for `room` may start at `now`. Records it if so;
    /// otherwise the room is owed one.
    pub fn try_acquire(&mut self, room: &RoomCode, now: Instant) -> bool {
        if self.allows(room, now) {
            self.last.insert(room.clone(), now);
            self.owed.remove(room);
            true
        } else {
            self.owed.insert(room.clone());
            false
        }
    }

    /// Owed rooms whose interval has passed at `now`, recorded as started.
    pub fn take_due(&mut self, now: Instant) -> Vec<RoomCode> {
        let due: Vec<RoomCode> = self
            .owed
            .iter()
            .filter(|room| self.allows(room, now))
            .cloned()
            .collect();
        for room in &due {
            self.owed.remove(room);
            self.last.insert(room.clone(), now);
        }
        due
    }

    /// Whether `room` is waiting for a held-back refetch.
    #[must_use]
    pub fn is_owed(&self, room: &RoomCode) -> bool {
        self.owed.contains(room)
    }

    fn allows(&self, room: &RoomCode, now: Instant) -> bool {
        self.last
            .get(room)
            .is_none_or(|last| now.saturating_duration_since(*last) >= self.interval)
    }

    /// Forget a room.
    pub fn forget(&mut self, room: &RoomCode) {
        self.last.remove(room);
        self.owed.remove(room);
    }
}
