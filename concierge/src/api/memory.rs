//! In-memory [`ChatApi`] for tests and offline demos.
//!
//! Holds rooms, per-room history and unread aggregates behind a
//! `parking_lot::Mutex`, records every call, and can be told to fail ticket
//! issuance or page fetches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use concierge_proto::message::{ChatMessage, MessagePage, RoomCode, RoomSummary, Seq};
use parking_lot::Mutex;

use super::{ApiError, ChatApi};
use crate::transport::Ticket;

/// A call observed by [`InMemoryApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `issue_ticket`
    IssueTicket,
    /// `fetch_rooms`
    FetchRooms,
    /// `fetch_page`
    FetchPage {
        /// Room requested.
        room: RoomCode,
        /// Page index requested.
        page_index: u32,
        /// Page size requested.
        page_size: u32,
    },
    /// `mark_read`
    MarkRead {
        /// Room marked.
        room: RoomCode,
        /// Cursor sent.
        last_read_seq: Seq,
    },
    /// `fetch_unread_counts`
    FetchUnreadCounts,
}

#[derive(Default)]
struct Store {
    rooms: BTreeMap<RoomCode, RoomSummary>,
    history: HashMap<RoomCode, Vec<ChatMessage>>,
    unread: BTreeMap<RoomCode, u32>,
    tickets_issued: u64,
    ticket_failure: Option<ApiError>,
    page_failure: Option<ApiError>,
    calls: Vec<ApiCall>,
}

/// In-memory chat API. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryApi {
    store: Arc<Mutex<Store>>,
}

impl InMemoryApi {
    /// Create an empty API.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a room.
    pub fn insert_room(&self, summary: RoomSummary) {
        let mut store = self.store.lock();
        store.unread.insert(summary.room_code.clone(), summary.unread_count);
        store.rooms.insert(summary.room_code.clone(), summary);
    }

    /// Append a message to a room's history, keeping it ordered by sequence.
    pub fn push_message(&self, message: ChatMessage) {
        let mut store = self.store.lock();
        let history = store.history.entry(message.room_code.clone()).or_default();
        let pos = history.partition_point(|m| m.seq < message.seq);
        history.insert(pos, message);
    }

    /// Set the unread aggregate for a room.
    pub fn set_unread(&self, room: &RoomCode, count: u32) {
        self.store.lock().unread.insert(room.clone(), count);
    }

    /// Make subsequent `issue_ticket` calls fail (or succeed again with `None`).
    pub fn fail_tickets(&self, failure: Option<ApiError>) {
        self.store.lock().ticket_failure = failure;
    }

    /// Make subsequent `fetch_page` calls fail (or succeed again with `None`).
    pub fn fail_pages(&self, failure: Option<ApiError>) {
        self.store.lock().page_failure = failure;
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.store.lock().calls.clone()
    }

    /// Page fetches made for `room`, as `(page_index, page_size)`.
    #[must_use]
    pub fn page_requests(&self, room: &RoomCode) -> Vec<(u32, u32)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::FetchPage {
                    room: r,
                    page_index,
                    page_size,
                } if r == *room => Some((page_index, page_size)),
                _ => None,
            })
            .collect()
    }

    /// Number of tickets handed out.
    #[must_use]
    pub fn tickets_issued(&self) -> u64 {
        self.store.lock().tickets_issued
    }

    fn page(
        store: &Store,
        room: &RoomCode,
        page_index: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiError> {
        let Some(history) = store.history.get(room) else {
            return if store.rooms.contains_key(room) {
                Ok(MessagePage {
                    items: Vec::new(),
                    is_last_page: true,
                })
            } else {
                Err(ApiError::RoomNotFound(room.clone()))
            };
        };
        let size = page_size as usize;
        let offset = page_index as usize * size;
        let items: Vec<ChatMessage> = history
            .iter()
            .rev()
            .skip(offset)
            .take(size)
            .cloned()
            .collect();
        Ok(MessagePage {
            items,
            is_last_page: offset + size >= history.len(),
        })
    }
}

impl ChatApi for InMemoryApi {
    async fn issue_ticket(&self) -> Result<Ticket, ApiError> {
        let mut store = self.store.lock();
        store.calls.push(ApiCall::IssueTicket);
        if let Some(failure) = store.ticket_failure.clone() {
            return Err(failure);
        }
        store.tickets_issued += 1;
        Ok(Ticket::new(format!("ticket-{}", store.tickets_issued)))
    }

    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>, ApiError> {
        let mut store = self.store.lock();
        store.calls.push(ApiCall::FetchRooms);
        let unread = store.unread.clone();
        Ok(store
            .rooms
            .values()
            .cloned()
            .map(|mut summary| {
                summary.unread_count = unread.get(&summary.room_code).copied().unwrap_or(0);
                summary
            })
            .collect())
    }

    async fn fetch_page(
        &self,
        room: &RoomCode,
        page_index: u32,
        page_size: u32,
    ) -> Result<MessagePage, ApiError> {
        let mut store = self.store.lock();
        store.calls.push(ApiCall::FetchPage {
            room: room.clone(),
            page_index,
            page_size,
        });
        if let Some(failure) = store.page_failure.clone() {
            return Err(failure);
        }
        Self::page(&store, room, page_index, page_size)
    }

    async fn mark_read(&self, room: &RoomCode, last_read_seq: Seq) -> Result<(), ApiError> {
        let mut store = self.store.lock();
        store.calls.push(ApiCall::MarkRead {
            room: room.clone(),
            last_read_seq,
        });
        store.unread.insert(room.clone(), 0);
        Ok(())
    }

    async fn fetch_unread_counts(&self) -> Result<BTreeMap<RoomCode, u32>, ApiError> {
        let mut store = self.store.lock();
        store.calls.push(ApiCall::FetchUnreadCounts);
        Ok(store.unread.clone())
    }
}
