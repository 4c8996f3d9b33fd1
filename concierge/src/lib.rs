//! Concierge: real-time chat session layer for the ticketing portal.

pub mod api;
pub mod config;
pub mod receipts;
pub mod room;
pub mod router;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod transport;
pub mod unread;
