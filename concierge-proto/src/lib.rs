//! Shared protocol definitions for the Concierge wire format.
//!
//! The realtime link carries STOMP-style text frames ([`frame`]); frame
//! bodies are JSON documents describing server events ([`event`]) or client
//! actions ([`action`]) addressed to logical channels ([`channel`]).

pub mod action;
pub mod channel;
pub mod codec;
pub mod event;
pub mod frame;
pub mod message;
