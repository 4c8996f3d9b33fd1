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

//! Read receipts and unread aggregates across two live sessions.

mod common;

use common::Relay;
use concierge::session::SessionEvent;
use concierge_proto::message::{Party, Role, Seq};
use concierge_relay::broker::Identity;

#[tokio::test]
async fn operator_reading_clears_markers_on_user_side() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut op = relay.connected("op-1", Role::Operator).await;
    user.session.open_room(&room).await.unwrap();

    for text in ["first", "second"] {
        user.session.send(&room, text).unwrap();
        user.next_event("confirmation", |e| matches!(e, SessionEvent::MessageConfirmed { .. }))
            .await;
    }
    let markers: Vec<u32> = user
        .session
        .stream(&room)
        .unwrap()
        .messages()
        .iter()
        .map(|m| m.unread_count)
        .collect();
    assert_eq!(markers, vec![1, 1]);

    op.session.open_room(&room).await.unwrap();
    op.session.mark_read(&room, Seq::new(2)).await.unwrap();

    let cleared = user
        .next_event("markers cleared", |e| matches!(e, SessionEvent::UnreadMarkersCleared { .. }))
        .await;
    let SessionEvent::UnreadMarkersCleared { party, up_to, ids, .. } = cleared else {
        unreachable!()
    };
    assert_eq!(party, Party::EndUser);
    assert_eq!(up_to, Seq::new(2));
    assert_eq!(ids.len(), 2);
    assert!(
        user.session
            .stream(&room)
            .unwrap()
            .messages()
            .iter()
            .all(|m| m.unread_count == 0)
    );
}

#[tokio::test]
async fn unread_total_follows_messages_and_reads() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut op = relay.connected("op-1", Role::Operator).await;
    user.session.open_room(&room).await.unwrap();

    user.session.send(&room, "anyone there?").unwrap();
    op.until("one unread", |s| s.unread().total() == 1).await;
    assert_eq!(op.session.unread().get(&room), 1);

    op.session.mark_read(&room, Seq::new(1)).await.unwrap();
    assert_eq!(op.session.unread().total(), 0);
    op.run_for(std::time::Duration::from_millis(200)).await;
    assert_eq!(op.session.unread().total(), 0);

    let staff = Identity::new("op-1", Role::Operator);
    assert_eq!(relay.broker.unread_counts(&staff).get(&room), Some(&0));
}

#[tokio::test]
async fn offline_mark_read_goes_through_the_api() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");
    relay.broker.post_agent_message(&room, "welcome");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    user.session.open_room(&room).await.unwrap();

    // Never connected: the receipt must use the REST endpoint.
    let mut op = relay.peer("op-1", Role::Operator);
    assert!(!op.session.is_connected());
    user.session.send(&room, "hello").unwrap();
    user.next_event("confirmation", |e| matches!(e, SessionEvent::MessageConfirmed { .. }))
        .await;
    op.session.mark_read(&room, Seq::new(2)).await.unwrap();

    let staff = Identity::new("op-1", Role::Operator);
    assert_eq!(relay.broker.unread_counts(&staff).get(&room), Some(&0));
    user.next_event("markers cleared", |e| {
        matches!(e, SessionEvent::UnreadMarkersCleared { party: Party::EndUser, .. })
    })
    .await;
}
