// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Reconnection against a live relay.
//!
//! Dropping every socket on the relay side must bring each session back up
//! on its own, with its channel subscriptions restored. When the relay is
//! gone for good, the session falls back to polling.

mod common;

use common::Relay;
use concierge::session::SessionEvent;
use concierge::unread::DeliveryMode;
use concierge_proto::message::Role;

fn link(up: bool) -> impl Fn(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::ConnectionChanged { connected, .. } if *connected == up)
}

#[tokio::test]
async fn sessions_reconnect_and_resubscribe_after_relay_drop() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut op = relay.connected("op-1", Role::Operator).await;
    user.session.open_room(&room).await.unwrap();
    op.session.open_room(&room).await.unwrap();

    assert_eq!(relay.broker.kick_all(), 2);
    for peer in [&mut user, &mut op] {
        peer.next_event("link down", link(false)).await;
        peer.next_event("link back", link(true)).await;
        assert_eq!(peer.session.delivery_mode(), DeliveryMode::Live);
    }

    user.session.send(&room, "still here?").unwrap();
    user.next_event("confirmation", |e| matches!(e, SessionEvent::MessageConfirmed { .. }))
        .await;
    op.until("message after reconnect", |s| {
        s.stream(&room)
            .is_some_and(|st| st.messages().iter().any(|m| m.content == "still here?"))
    })
    .await;
}

#[tokio::test]
async fn relay_gone_falls_back_to_polling() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    user.session.open_room(&room).await.unwrap();

    relay.handle.abort();
    relay.broker.kick_all();

    user.next_event("polling", |e| {
        matches!(e, SessionEvent::DeliveryModeChanged { mode: DeliveryMode::Polling })
    })
    .await;
    assert!(!user.session.is_connected());
    assert!(user.session.send(&room, "hello?").is_err());
}
