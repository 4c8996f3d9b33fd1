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

//! Optimistic sends against a live relay: each send shows up as a pending
//! entry, is confirmed exactly once by the server echo, and reaches the
//! other side as a live message.

mod common;

use common::Relay;
use concierge::room::RoomError;
use concierge::session::{SendError, SessionEvent};
use concierge_proto::message::{Role, SenderType};

#[tokio::test]
async fn send_is_confirmed_once_and_delivered_to_operator() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut op = relay.connected("op-1", Role::Operator).await;
    user.session.open_room(&room).await.unwrap();
    op.session.open_room(&room).await.unwrap();

    let temp_id = user.session.send(&room, "hello").unwrap();
    let stream = user.session.stream(&room).unwrap();
    assert_eq!(stream.pending().len(), 1);
    assert_eq!(stream.pending()[0].temp_id, temp_id);

    let confirmed = user
        .next_event("confirmation", |e| matches!(e, SessionEvent::MessageConfirmed { .. }))
        .await;
    let SessionEvent::MessageConfirmed { temp_id: confirmed_temp, .. } = confirmed else {
        unreachable!()
    };
    assert_eq!(confirmed_temp, temp_id);
    assert!(user.session.stream(&room).unwrap().pending().is_empty());
    assert_eq!(user.contents(&room), vec!["hello"]);

    op.next_event("live message", |e| matches!(e, SessionEvent::MessageAppended { .. }))
        .await;
    let received = &op.session.stream(&room).unwrap().messages()[0];
    assert_eq!(received.content, "hello");
    assert_eq!(received.sender_type, SenderType::EndUser);

    // Let reconciliation run; the stream must not grow a duplicate.
    user.run_for(std::time::Duration::from_millis(500)).await;
    assert_eq!(user.contents(&room), vec!["hello"]);
    assert_eq!(relay.broker.messages(&room).len(), 1);
    assert_eq!(
        user.seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::MessageConfirmed { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn operator_cannot_send_while_agent_is_active() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut op = relay.connected("op-1", Role::Operator).await;
    op.session.refresh_rooms().await.unwrap();
    op.session.open_room(&room).await.unwrap();

    let err = op.session.send(&room, "hi").unwrap_err();
    assert!(matches!(err, SendError::Room(RoomError::AutomatedAgentActive(_))));
    assert!(op.session.stream(&room).unwrap().pending().is_empty());
    assert!(relay.broker.messages(&room).is_empty());
}

#[tokio::test]
async fn history_loads_before_live_messages_continue() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");
    for i in 1..=10 {
        relay.broker.post_agent_message(&room, &format!("m{i}"));
    }

    let mut user = relay.connected("u-1", Role::EndUser).await;
    user.session.open_room(&room).await.unwrap();
    let stream = user.session.stream(&room).unwrap();
    assert_eq!(stream.messages().len(), 8);
    assert!(stream.has_more());

    user.session.load_older(&room, None).await.unwrap();
    let expected: Vec<String> = (1..=10).map(|i| format!("m{i}")).collect();
    assert_eq!(user.contents(&room), expected);

    relay.broker.post_agent_message(&room, "m11");
    user.next_event("live message", |e| matches!(e, SessionEvent::MessageAppended { .. }))
        .await;
    assert_eq!(user.contents(&room).last().map(String::as_str), Some("m11"));
}
