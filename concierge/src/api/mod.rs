//! Request/response access to the portal's chat API.
//!
//! The realtime link only carries what happens from now on. History pages,
//! the room list, unread aggregates, connection tickets and the REST form of
//! "mark read" all come through a [`ChatApi`]:
//! - [`http::HttpChatApi`]: the portal's JSON API over `reqwest`
//! - [`memory::InMemoryApi`]: in-process implementation for tests and demos

pub mod http;
pub mod memory;

use std::collections::BTreeMap;

use concierge_proto::message::{MessagePage, RoomCode, RoomSummary, Seq};

use crate::transport::Ticket;

/// Errors returned by [`ChatApi`] calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The caller's credential was refused.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server answered with an unexpected status.
    #[error("server returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response text or reason.
        message: String,
    },

    /// The request never got an answer.
    #[error("request failed: {0}")]
    Network(String),

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The referenced room does not exist.
    #[error("room {0} not found")]
    RoomNotFound(RoomCode),
}

/// The portal's chat API.
///
/// Every method returns a `Send` future so calls can run on spawned tasks.
pub trait ChatApi: Send + Sync + 'static {
    /// Exchange the caller's existing credential for a single-use ticket.
    fn issue_ticket(&self) -> impl std::future::Future<Output = Result<Ticket, ApiError>> + Send;

    /// The caller's rooms.
    fn fetch_rooms(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RoomSummary>, ApiError>> + Send;

    /// Page `page_index` of `room`'s history, newest first, `page_size` long.
    fn fetch_page(
        &self,
        room: &RoomCode,
        page_index: u32,
        page_size: u32,
    ) -> impl std::future::Future<Output = Result<MessagePage, ApiError>> + Send;

    /// Record that the caller has read `room` up to `last_read_seq`.
    fn mark_read(
        &self,
        room: &RoomCode,
        last_read_seq: Seq,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;

    /// Unread aggregates for every room the caller belongs to.
    fn fetch_unread_counts(
        &self,
    ) -> impl std::future::Future<Output = Result<BTreeMap<RoomCode, u32>, ApiError>> + Send;
}
