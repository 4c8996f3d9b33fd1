//! Per-room message stream.
//!
//! A [`MessageStream`] holds what a room view shows: confirmed messages in
//! ascending `seq` order, followed by the caller's pending (optimistic)
//! sends. It knows nothing about the network. Pagination is split into
//! `begin_*` calls that hand out a [`PageRequest`] and `apply_*` calls that
//! take the response; every request carries the stream's generation so a
//! response that arrives after the stream was reset is rejected as stale.
//!
//! Merging rules:
//! - a message whose id is already present is never added twice
//! - a confirmed message that matches a pending send replaces it; the match
//!   is by client reference first, then by sender and content within the
//!   echo window
//! - anything else is inserted by `seq`; inbound messages are never dropped

pub mod scroll;

use std::collections::HashSet;
use std::time::Duration;

use concierge_proto::message::{
    ChatMessage, MessageId, MessagePage, Party, RoomCode, SenderType, Seq, Timestamp, UserId,
};
use tokio::time::Instant;

use crate::config::ChatConfig;
pub use scroll::{ScrollAnchor, ScrollIntent, Viewport};

/// Temporary id of a pending send. Also sent as the message's client
/// reference so the server echo can be matched exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(String);

impl TempId {
    /// A fresh temporary id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("tmp-{}", uuid::Uuid::now_v7()))
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery status of a pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Transmitted, waiting for the server echo.
    Sending,
    /// Not confirmed; can be retried or discarded.
    Failed,
}

/// An optimistic message shown before the server confirms it.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Temporary id.
    pub temp_id: TempId,
    /// Message text.
    pub content: String,
    /// Who is sending.
    pub sender_id: UserId,
    /// Sender type for display.
    pub sender_type: SenderType,
    /// When the send was issued, for display.
    pub created_at: Timestamp,
    /// Current status.
    pub status: PendingStatus,
    queued_at: Instant,
}

/// One row of the stream, in display order.
#[derive(Debug, Clone, Copy)]
pub enum StreamItem<'a> {
    /// A server-confirmed message.
    Confirmed(&'a ChatMessage),
    /// A pending send.
    Pending(&'a PendingMessage),
}

/// Stream-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// A page response arrived after the stream was reset.
    #[error("stale page response (generation {got}, current {current})")]
    Stale {
        /// Generation the request was issued under.
        got: u64,
        /// Current generation.
        current: u64,
    },

    /// The server has no older history.
    #[error("no older history")]
    Exhausted,

    /// An older-page load is already running.
    #[error("an older-page load is already in flight")]
    Busy,

    /// No pending send has this id.
    #[error("no pending message {0}")]
    UnknownPending(TempId),

    /// The pending send has not failed, so it cannot be retried.
    #[error("pending message {0} is still sending")]
    StillSending(TempId),
}

/// A history fetch to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Room to fetch.
    pub room: RoomCode,
    /// Page counter value.
    pub page_index: u32,
    /// Requested page size.
    pub page_size: u32,
    /// Stream generation the response must match.
    pub generation: u64,
}

/// What `merge_live` did with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Added at the end.
    Appended {
        /// Message id.
        id: MessageId,
        /// The viewport was near the bottom, so the view should follow.
        autoscroll: bool,
    },
    /// Added before the end because it arrived out of order.
    Inserted {
        /// Message id.
        id: MessageId,
        /// Position among confirmed messages.
        index: usize,
    },
    /// Replaced a pending send.
    Confirmed {
        /// The pending send's temporary id.
        temp_id: TempId,
        /// The confirmed id.
        id: MessageId,
        /// Whether the view should follow.
        autoscroll: bool,
    },
    /// Already present.
    Duplicate,
}

/// Result of a reconciliation refetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Messages that were missing locally.
    pub added: usize,
    /// Messages whose unread marker changed.
    pub updated: usize,
}

#[derive(Debug)]
enum Preload {
    Idle,
    InFlight { page_index: u32 },
    Ready { page_index: u32, page: MessagePage },
}

/// Messages and pagination state for one room.
#[derive(Debug)]
pub struct MessageStream {
    room: RoomCode,
    initial_page_size: u32,
    older_page_size: u32,
    echo_window: Duration,
    autoscroll_threshold: f64,
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
    pending: Vec<PendingMessage>,
    generation: u64,
    next_page: u32,
    has_more: bool,
    loaded: bool,
    older_in_flight: bool,
    preload: Preload,
}

impl MessageStream {
    /// An empty, unloaded stream for `room`.
    #[must_use]
    pub fn new(room: RoomCode, config: &ChatConfig) -> Self {
        Self {
            room,
            initial_page_size: config.initial_page_size,
            older_page_size: config.older_page_size,
            echo_window: config.echo_window,
            autoscroll_threshold: config.autoscroll_threshold_px,
            messages: Vec::new(),
            ids: HashSet::new(),
            pending: Vec::new(),
            generation: 0,
            next_page: 0,
            has_more: false,
            loaded: false,
            older_in_flight: false,
            preload: Preload::Idle,
        }
    }

    /// Continue counting generations from `generation`, so results requested
    /// by an earlier stream for the same room are stale here.
    #[must_use]
    pub fn starting_at(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// The room.
    #[must_use]
    pub const fn room(&self) -> &RoomCode {
        &self.room
    }

    /// Confirmed messages, ascending by `seq`.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Pending sends, oldest first.
    #[must_use]
    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    /// Everything in display order: confirmed, then pending.
    pub fn items(&self) -> impl Iterator<Item = StreamItem<'_>> {
        self.messages
            .iter()
            .map(StreamItem::Confirmed)
            .chain(self.pending.iter().map(StreamItem::Pending))
    }

    /// Whether older history may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether the initial page has been applied.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Current generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Highest confirmed `seq`, if any.
    #[must_use]
    pub fn max_seq(&self) -> Option<Seq> {
        self.messages.last().map(|m| m.seq)
    }

    /// Whether a message id is present.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Look up a pending send.
    #[must_use]
    pub fn pending_by_id(&self, temp_id: &TempId) -> Option<&PendingMessage> {
        self.pending.iter().find(|p| p.temp_id == *temp_id)
    }

    // -- pagination -----------------------------------------------------

    /// Start (or restart) the initial load. Invalidates any outstanding
    /// older-page load or preload.
    pub fn begin_initial(&mut self) -> PageRequest {
        self.generation += 1;
        self.older_in_flight = false;
        self.preload = Preload::Idle;
        PageRequest {
            room: self.room.clone(),
            page_index: 0,
            page_size: self.initial_page_size,
            generation: self.generation,
        }
    }

    /// Apply the initial page. Returns how many messages were added.
    ///
    /// # Errors
    ///
    /// [`StreamError::Stale`] if the stream was reset since the request.
    pub fn apply_initial(&mut self, generation: u64, page: MessagePage) -> Result<usize, StreamError> {
        self.check_generation(generation)?;
        self.has_more = page.items.len() == self.initial_page_size as usize;
        self.next_page = 1;
        self.loaded = true;
        Ok(self.absorb_page(page))
    }

    /// Start loading the next older page.
    ///
    /// # Errors
    ///
    /// [`StreamError::Exhausted`] when there is nothing older and
    /// [`StreamError::Busy`] when a load is already running.
    pub fn begin_older(&mut self) -> Result<PageRequest, StreamError> {
        if !self.has_more {
            return Err(StreamError::Exhausted);
        }
        if self.older_in_flight || matches!(self.preload, Preload::InFlight { .. }) {
            return Err(StreamError::Busy);
        }
        self.older_in_flight = true;
        Ok(self.older_request(self.next_page))
    }

    /// Apply an older page fetched under `page_index`. Returns how many
    /// messages were added.
    ///
    /// # Errors
    ///
    /// [`StreamError::Stale`] if the stream was reset since the request.
    pub fn apply_older(
        &mut self,
        generation: u64,
        page_index: u32,
        page: MessagePage,
    ) -> Result<usize, StreamError> {
        self.check_generation(generation)?;
        self.older_in_flight = false;
        self.has_more = page.items.len() == self.older_page_size as usize;
        self.next_page = page_index + 1;
        Ok(self.absorb_page(page))
    }

    /// Forget a failed older-page load so it can be retried.
    pub fn abort_older(&mut self, generation: u64) {
        if generation == self.generation {
            self.older_in_flight = false;
        }
    }

    /// Start a background fetch of the next older page, unless one is already
    /// running or ready, or there is nothing older.
    pub fn begin_preload(&mut self) -> Option<PageRequest> {
        if !self.has_more || self.older_in_flight || !matches!(self.preload, Preload::Idle) {
            return None;
        }
        let page_index = self.next_page;
        self.preload = Preload::InFlight { page_index };
        Some(self.older_request(page_index))
    }

    /// Keep a preloaded page until the reader scrolls far enough to show it.
    ///
    /// # Errors
    ///
    /// [`StreamError::Stale`] if the stream was reset or the preload was
    /// cancelled since the request.
    pub fn store_preload(
        &mut self,
        generation: u64,
        page_index: u32,
        page: MessagePage,
    ) -> Result<(), StreamError> {
        self.check_generation(generation)?;
        match self.preload {
            Preload::InFlight { page_index: expected } if expected == page_index => {
                self.preload = Preload::Ready { page_index, page };
                Ok(())
            }
            _ => Err(StreamError::Stale {
                got: generation,
                current: self.generation,
            }),
        }
    }

    /// Take a ready preloaded page as `(page_index, page)`.
    pub fn take_preloaded(&mut self) -> Option<(u32, MessagePage)> {
        match std::mem::replace(&mut self.preload, Preload::Idle) {
            Preload::Ready { page_index, page } => Some((page_index, page)),
            other => {
                self.preload = other;
                None
            }
        }
    }

    /// Drop an in-flight or ready preload.
    pub fn cancel_preload(&mut self) {
        self.preload = Preload::Idle;
    }

    /// Whether a preload is running.
    #[must_use]
    pub const fn preload_in_flight(&self) -> bool {
        matches!(self.preload, Preload::InFlight { .. })
    }

    fn older_request(&self, page_index: u32) -> PageRequest {
        PageRequest {
            room: self.room.clone(),
            page_index,
            page_size: self.older_page_size,
            generation: self.generation,
        }
    }

    fn check_generation(&self, generation: u64) -> Result<(), StreamError> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(StreamError::Stale {
                got: generation,
                current: self.generation,
            })
        }
    }

    fn absorb_page(&mut self, page: MessagePage) -> usize {
        let mut added = 0;
        for message in page.items {
            if self.ids.contains(&message.id) {
                continue;
            }
            if let Some(reference) = message.client_ref.as_deref() {
                self.pending.retain(|p| p.temp_id.as_str() != reference);
            }
            self.insert_confirmed(message);
            added += 1;
        }
        added
    }

    // -- live merge -----------------------------------------------------

    /// Merge a message delivered on the live channel.
    ///
    /// `viewport` is the host's last reported geometry; without one the view
    /// is assumed to follow new messages.
    pub fn merge_live(
        &mut self,
        message: ChatMessage,
        viewport: Option<&Viewport>,
        now: Instant,
    ) -> MergeOutcome {
        if self.ids.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        let autoscroll = viewport.is_none_or(|v| v.is_near_bottom(self.autoscroll_threshold));
        let matched = self.take_matching_pending(&message, now);
        let id = message.id.clone();
        let index = self.insert_confirmed(message);

        match matched {
            Some(temp_id) => MergeOutcome::Confirmed {
                temp_id,
                id,
                autoscroll,
            },
            None if index + 1 == self.messages.len() => MergeOutcome::Appended { id, autoscroll },
            None => MergeOutcome::Inserted { id, index },
        }
    }

    fn take_matching_pending(&mut self, message: &ChatMessage, now: Instant) -> Option<TempId> {
        let by_reference = message
            .client_ref
            .as_deref()
            .and_then(|r| self.pending.iter().position(|p| p.temp_id.as_str() == r));
        let position = by_reference.or_else(|| {
            self.pending.iter().position(|p| {
                p.sender_id == message.sender_id
                    && p.content == message.content
                    && now.saturating_duration_since(p.queued_at) <= self.echo_window
            })
        })?;
        Some(self.pending.remove(position).temp_id)
    }

    fn insert_confirmed(&mut self, message: ChatMessage) -> usize {
        let index = self.messages.partition_point(|m| m.seq <= message.seq);
        self.ids.insert(message.id.clone());
        self.messages.insert(index, message);
        index
    }

    // -- pending sends --------------------------------------------------

    /// Add an optimistic entry for an outgoing message.
    pub fn push_pending(
        &mut self,
        content: &str,
        sender_id: UserId,
        sender_type: SenderType,
        now: Instant,
    ) -> TempId {
        let temp_id = TempId::generate();
        self.pending.push(PendingMessage {
            temp_id: temp_id.clone(),
            content: content.to_string(),
            sender_id,
            sender_type,
            created_at: Timestamp::now(),
            status: PendingStatus::Sending,
            queued_at: now,
        });
        temp_id
    }

    /// Mark one pending send failed. Returns `false` if it is unknown.
    pub fn fail_pending(&mut self, temp_id: &TempId) -> bool {
        match self.pending.iter_mut().find(|p| p.temp_id == *temp_id) {
            Some(pending) => {
                pending.status = PendingStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Mark every in-flight send failed and return their ids.
    pub fn fail_all_pending(&mut self) -> Vec<TempId> {
        self.pending
            .iter_mut()
            .filter(|p| p.status == PendingStatus::Sending)
            .map(|p| {
                p.status = PendingStatus::Failed;
                p.temp_id.clone()
            })
            .collect()
    }

    /// Mark sends that have waited longer than the echo window failed.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<TempId> {
        let window = self.echo_window;
        self.pending
            .iter_mut()
            .filter(|p| {
                p.status == PendingStatus::Sending
                    && now.saturating_duration_since(p.queued_at) > window
            })
            .map(|p| {
                p.status = PendingStatus::Failed;
                p.temp_id.clone()
            })
            .collect()
    }

    /// Put a failed send back in flight. Returns its content.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownPending`] or [`StreamError::StillSending`].
    pub fn retry(&mut self, temp_id: &TempId, now: Instant) -> Result<String, StreamError> {
        let pending = self
            .pending
            .iter_mut()
            .find(|p| p.temp_id == *temp_id)
            .ok_or_else(|| StreamError::UnknownPending(temp_id.clone()))?;
        if pending.status != PendingStatus::Failed {
            return Err(StreamError::StillSending(temp_id.clone()));
        }
        pending.status = PendingStatus::Sending;
        pending.queued_at = now;
        Ok(pending.content.clone())
    }

    /// Remove a pending send.
    ///
    /// # Errors
    ///
    /// [`StreamError::UnknownPending`] if there is no such send.
    pub fn discard(&mut self, temp_id: &TempId) -> Result<PendingMessage, StreamError> {
        let position = self
            .pending
            .iter()
            .position(|p| p.temp_id == *temp_id)
            .ok_or_else(|| StreamError::UnknownPending(temp_id.clone()))?;
        Ok(self.pending.remove(position))
    }

    // -- read markers ---------------------------------------------------

    /// Zero the unread marker on `party`'s messages with `seq <= up_to`.
    /// Returns the ids that changed.
    pub fn zero_unread(&mut self, party: Party, up_to: Seq) -> Vec<MessageId> {
        self.messages
            .iter_mut()
            .filter(|m| {
                m.seq <= up_to && m.unread_count > 0 && m.sender_type.party() == Some(party)
            })
            .map(|m| {
                m.unread_count = 0;
                m.id.clone()
            })
            .collect()
    }

    /// Fold a refetched page into the stream: missing messages are added and
    /// unread markers take the server's values.
    pub fn reconcile(&mut self, page: MessagePage) -> Reconciled {
        let mut outcome = Reconciled::default();
        for message in page.items {
            match self.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    if existing.unread_count != message.unread_count {
                        existing.unread_count = message.unread_count;
                        outcome.updated += 1;
                    }
                }
                None => {
                    if let Some(reference) = message.client_ref.as_deref() {
                        self.pending.retain(|p| p.temp_id.as_str() != reference);
                    }
                    self.insert_confirmed(message);
                    outcome.added += 1;
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChatConfig {
        ChatConfig::default()
    }

    fn message(seq: u64, sender: &str, sender_type: SenderType, content: &str) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(format!("m-{seq}")),
            room_code: RoomCode::new("R1"),
            seq: Seq::new(seq),
            sender_id: UserId::new(sender),
            sender_type,
            content: content.to_string(),
            sent_at: Timestamp::from_millis(seq * 1000),
            unread_count: 1,
            client_ref: None,
        }
    }

    fn user_message(seq: u64) -> ChatMessage {
        message(seq, "u-1", SenderType::EndUser, &format!("hello {seq}"))
    }

    fn page(seqs: impl IntoIterator<Item = u64>, is_last_page: bool) -> MessagePage {
        MessagePage {
            items: seqs.into_iter().map(user_message).collect(),
            is_last_page,
        }
    }

    fn seqs(stream: &MessageStream) -> Vec<u64> {
        stream.messages().iter().map(|m| m.seq.value()).collect()
    }

    fn stream() -> MessageStream {
        MessageStream::new(RoomCode::new("R1"), &config())
    }

    #[test]
    fn initial_page_is_sorted_and_sets_has_more() {
        let mut stream = stream();
        let req = stream.begin_initial();
        assert_eq!((req.page_index, req.page_size), (0, 8));

        let added = stream
            .apply_initial(req.generation, page((5..=12).rev(), false))
            .unwrap();
        assert_eq!(added, 8);
        assert_eq!(seqs(&stream), (5..=12).collect::<Vec<_>>());
        assert!(stream.has_more());

        let mut short = self::stream();
        let req = short.begin_initial();
        short.apply_initial(req.generation, page([3, 2, 1], true)).unwrap();
        assert!(!short.has_more());
        assert!(matches!(short.begin_older(), Err(StreamError::Exhausted)));
    }

    #[test]
    fn older_pages_use_counter_and_dedup_overlap() {
        let mut stream = stream();
        let req = stream.begin_initial();
        stream.apply_initial(req.generation, page((5..=12).rev(), false)).unwrap();

        let older = stream.begin_older().unwrap();
        assert_eq!((older.page_index, older.page_size), (1, 5));
        assert!(matches!(stream.begin_older(), Err(StreamError::Busy)));

        // Page 1 of size 5 overlaps the first page by three messages.
        let added = stream
            .apply_older(older.generation, older.page_index, page((3..=7).rev(), false))
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(seqs(&stream), (3..=12).collect::<Vec<_>>());

        let next = stream.begin_older().unwrap();
        assert_eq!(next.page_index, 2);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut stream = stream();
        let first = stream.begin_initial();
        let second = stream.begin_initial();
        assert!(matches!(
            stream.apply_initial(first.generation, page([1], true)),
            Err(StreamError::Stale { .. })
        ));
        assert!(stream.apply_initial(second.generation, page([1], true)).is_ok());
    }

    #[test]
    fn replacement_stream_rejects_predecessor_pages() {
        let mut old = stream();
        let request = old.begin_initial();

        let mut fresh = stream().starting_at(old.generation());
        let own = fresh.begin_initial();
        assert!(own.generation > request.generation);
        assert!(matches!(
            fresh.apply_older(request.generation, 1, page(1..=5, false)),
            Err(StreamError::Stale { .. })
        ));
        assert!(fresh.messages().is_empty());
    }

    #[test]
    fn out_of_order_live_messages_converge() {
        let mut stream = stream();
        let now = Instant::now();
        for seq in [3, 1, 2, 3, 5, 4] {
            stream.merge_live(user_message(seq), None, now);
        }
        assert_eq!(seqs(&stream), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn merge_reports_append_insert_and_duplicate() {
        let mut stream = stream();
        let now = Instant::now();
        assert!(matches!(
            stream.merge_live(user_message(2), None, now),
            MergeOutcome::Appended { autoscroll: true, .. }
        ));
        assert_eq!(
            stream.merge_live(user_message(1), None, now),
            MergeOutcome::Inserted {
                id: MessageId::new("m-1"),
                index: 0
            }
        );
        assert_eq!(stream.merge_live(user_message(2), None, now), MergeOutcome::Duplicate);
    }

    #[test]
    fn autoscroll_only_near_bottom() {
        let mut stream = stream();
        let now = Instant::now();
        let reading_history = Viewport {
            scroll_top: 0.0,
            scroll_height: 2000.0,
            client_height: 500.0,
        };
        assert!(matches!(
            stream.merge_live(user_message(1), Some(&reading_history), now),
            MergeOutcome::Appended { autoscroll: false, .. }
        ));
        let at_bottom = Viewport {
            scroll_top: 1450.0,
            ..reading_history
        };
        assert!(matches!(
            stream.merge_live(user_message(2), Some(&at_bottom), now),
            MergeOutcome::Appended { autoscroll: true, .. }
        ));
    }

    #[test]
    fn echo_replaces_pending_by_content() {
        let mut stream = stream();
        let now = Instant::now();
        let temp = stream.push_pending("hello", UserId::new("u-1"), SenderType::EndUser, now);
        assert_eq!(stream.items().count(), 1);

        let echo = message(1, "u-1", SenderType::EndUser, "hello");
        match stream.merge_live(echo, None, now) {
            MergeOutcome::Confirmed { temp_id, .. } => assert_eq!(temp_id, temp),
            other => panic!("expected confirmation, got {other:?}"),
        }
        assert!(stream.pending().is_empty());
        assert_eq!(stream.items().count(), 1);
    }

    #[test]
    fn echo_prefers_client_reference() {
        let mut stream = stream();
        let now = Instant::now();
        let first = stream.push_pending("ok", UserId::new("u-1"), SenderType::EndUser, now);
        let second = stream.push_pending("ok", UserId::new("u-1"), SenderType::EndUser, now);

        let mut echo = message(1, "u-1", SenderType::EndUser, "ok");
        echo.client_ref = Some(second.as_str().to_string());
        assert!(matches!(
            stream.merge_live(echo, None, now),
            MergeOutcome::Confirmed { temp_id, .. } if temp_id == second
        ));
        assert_eq!(stream.pending().len(), 1);
        assert_eq!(stream.pending()[0].temp_id, first);
    }

    #[test]
    fn echo_outside_window_is_a_new_message() {
        let mut stream = stream();
        let then = Instant::now();
        stream.push_pending("hello", UserId::new("u-1"), SenderType::EndUser, then);
        let later = then + Duration::from_secs(60);
        assert!(matches!(
            stream.merge_live(message(1, "u-1", SenderType::EndUser, "hello"), None, later),
            MergeOutcome::Appended { .. }
        ));
        assert_eq!(stream.pending().len(), 1);
    }

    #[test]
    fn other_senders_never_match_pending() {
        let mut stream = stream();
        let now = Instant::now();
        stream.push_pending("hi", UserId::new("u-1"), SenderType::EndUser, now);
        assert!(matches!(
            stream.merge_live(message(1, "bot", SenderType::Automated, "hi"), None, now),
            MergeOutcome::Appended { .. }
        ));
        assert_eq!(stream.pending().len(), 1);
    }

    #[test]
    fn pending_lifecycle() {
        let mut stream = stream();
        let now = Instant::now();
        let temp = stream.push_pending("hi", UserId::new("u-1"), SenderType::EndUser, now);
        assert!(matches!(stream.retry(&temp, now), Err(StreamError::StillSending(_))));

        assert_eq!(stream.fail_all_pending(), vec![temp.clone()]);
        assert_eq!(stream.pending()[0].status, PendingStatus::Failed);
        assert_eq!(stream.retry(&temp, now).unwrap(), "hi");
        assert_eq!(stream.pending()[0].status, PendingStatus::Sending);

        let expired = stream.expire_pending(now + Duration::from_secs(60));
        assert_eq!(expired, vec![temp.clone()]);

        stream.discard(&temp).unwrap();
        assert!(matches!(stream.discard(&temp), Err(StreamError::UnknownPending(_))));
    }

    #[test]
    fn zero_unread_respects_party_and_cursor() {
        let mut stream = stream();
        let now = Instant::now();
        for seq in 1..=12 {
            let sender_type = if seq % 2 == 0 {
                SenderType::EndUser
            } else {
                SenderType::Operator
            };
            stream.merge_live(message(seq, "x", sender_type, "m"), None, now);
        }

        let cleared = stream.zero_unread(Party::EndUser, Seq::new(10));
        assert_eq!(cleared.len(), 5);
        for m in stream.messages() {
            let expect_zero = m.sender_type == SenderType::EndUser && m.seq.value() <= 10;
            assert_eq!(m.unread_count == 0, expect_zero, "seq {}", m.seq);
        }
        assert!(stream.zero_unread(Party::EndUser, Seq::new(10)).is_empty());
    }

    #[test]
    fn preload_is_held_until_taken() {
        let mut stream = stream();
        let req = stream.begin_initial();
        stream.apply_initial(req.generation, page((5..=12).rev(), false)).unwrap();

        let preload = stream.begin_preload().unwrap();
        assert!(stream.begin_preload().is_none());
        assert!(matches!(stream.begin_older(), Err(StreamError::Busy)));
        stream
            .store_preload(preload.generation, preload.page_index, page((1..=4).rev(), true))
            .unwrap();

        let (index, ready) = stream.take_preloaded().unwrap();
        assert!(stream.take_preloaded().is_none());
        stream.apply_older(preload.generation, index, ready).unwrap();
        assert_eq!(seqs(&stream), (1..=12).collect::<Vec<_>>());
        assert!(!stream.has_more());
    }

    #[test]
    fn cancelled_preload_response_is_stale() {
        let mut stream = stream();
        let req = stream.begin_initial();
        stream.apply_initial(req.generation, page((5..=12).rev(), false)).unwrap();
        let preload = stream.begin_preload().unwrap();
        stream.cancel_preload();
        assert!(stream
            .store_preload(preload.generation, preload.page_index, page([4], true))
            .is_err());
    }

    #[test]
    fn reconcile_adds_missing_and_updates_markers() {
        let mut stream = stream();
        let now = Instant::now();
        stream.merge_live(user_message(1), None, now);
        let mut refreshed = user_message(1);
        refreshed.unread_count = 0;
        let outcome = stream.reconcile(MessagePage {
            items: vec![user_message(2), refreshed],
            is_last_page: true,
        });
        assert_eq!(outcome, Reconciled { added: 1, updated: 1 });
        assert_eq!(seqs(&stream), vec![1, 2]);
    }
}
