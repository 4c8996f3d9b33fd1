//! Concierge development relay.
//!
//! An axum server that speaks the Concierge wire protocol: the framed chat
//! socket at `/ws` and the JSON chat API under `/api/chat`, backed by an
//! in-memory [`broker::Broker`]. Used for local development and as the
//! in-process server in integration tests.

pub mod broker;
pub mod config;
pub mod server;
