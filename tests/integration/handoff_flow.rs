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

//! Handoff between the automated agent and human operators, end to end.
//!
//! Local state only moves when the server says so; requests that the local
//! view already knows are invalid never leave the client, and rejections
//! the server makes come back as notices.

mod common;

use common::Relay;
use concierge::session::{NoticeKind, SessionError, SessionEvent};
use concierge_proto::message::{HandoffState, Role, UserId};

fn moved_to(state: HandoffState) -> impl Fn(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::HandoffChanged { to, .. } if *to == state)
}

#[tokio::test]
async fn request_accept_and_return() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut op = relay.connected("op-1", Role::Operator).await;
    op.session.refresh_rooms().await.unwrap();
    user.session.open_room(&room).await.unwrap();
    op.session.open_room(&room).await.unwrap();

    user.session.request_handoff(&room).unwrap();
    // Nothing changes until the server confirms.
    assert_eq!(user.session.rooms().state(&room), Some(HandoffState::AutomatedActive));

    user.next_event("waiting", moved_to(HandoffState::WaitingForOperator))
        .await;
    op.next_event("attention", |e| matches!(e, SessionEvent::AttentionRaised { .. }))
        .await;
    assert!(op.session.rooms().needs_attention(&room));

    op.session.accept_handoff(&room).unwrap();
    op.next_event("operator active", moved_to(HandoffState::OperatorActive))
        .await;
    assert!(!op.session.rooms().needs_attention(&room));
    user.next_event("operator active", moved_to(HandoffState::OperatorActive))
        .await;
    let operator = user.session.rooms().get(&room).unwrap().operator.clone().unwrap();
    assert_eq!(operator.id, UserId::new("op-1"));

    op.session.send(&room, "I can help with that").unwrap();
    user.next_event("operator message", |e| {
        matches!(e, SessionEvent::MessageAppended { .. } | SessionEvent::MessageInserted { .. })
    })
    .await;
    user.until("operator message in stream", |s| {
        s.stream(&room)
            .is_some_and(|st| st.messages().iter().any(|m| m.content == "I can help with that"))
    })
    .await;

    user.session.request_automated_return(&room).unwrap();
    op.next_event("back to agent", moved_to(HandoffState::AutomatedActive))
        .await;
    assert_eq!(relay.broker.room_state(&room), Some(HandoffState::AutomatedActive));
    assert!(op.session.rooms().get(&room).unwrap().operator.is_none());
}

#[tokio::test]
async fn locally_invalid_request_is_not_sent() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    user.session.open_room(&room).await.unwrap();

    let err = user.session.cancel_handoff(&room).unwrap_err();
    assert!(matches!(err, SessionError::Room(_)));
    let err = user.session.intervene(&room).unwrap_err();
    assert!(matches!(err, SessionError::Room(_)));

    user.run_for(std::time::Duration::from_millis(200)).await;
    assert_eq!(relay.broker.room_state(&room), Some(HandoffState::AutomatedActive));
}

#[tokio::test]
async fn losing_an_accept_race_becomes_a_notice() {
    let relay = Relay::start().await;
    let room = relay.room("R1", "u-1");

    let mut user = relay.connected("u-1", Role::EndUser).await;
    let mut first = relay.connected("op-1", Role::Operator).await;
    let mut second = relay.connected("op-2", Role::Operator).await;
    user.session.open_room(&room).await.unwrap();
    for op in [&mut first, &mut second] {
        op.session.refresh_rooms().await.unwrap();
    }

    user.session.request_handoff(&room).unwrap();
    for op in [&mut first, &mut second] {
        op.next_event("attention", |e| matches!(e, SessionEvent::AttentionRaised { .. }))
            .await;
    }

    first.session.accept_handoff(&room).unwrap();
    first
        .next_event("operator active", moved_to(HandoffState::OperatorActive))
        .await;

    // The second operator has not seen the update yet, so the request goes out.
    second.session.accept_handoff(&room).unwrap();
    let notice = second
        .next_event("rejection", |e| matches!(e, SessionEvent::Notice(_)))
        .await;
    let SessionEvent::Notice(notice) = notice else {
        unreachable!()
    };
    assert_eq!(notice.kind, NoticeKind::Validation);
    assert_eq!(notice.room, Some(room.clone()));

    second
        .until("caught up", |s| {
            s.rooms().state(&room) == Some(HandoffState::OperatorActive)
        })
        .await;
    let operator = relay.broker.room_summaries(&concierge_relay::broker::Identity::new(
        "op-2",
        Role::Operator,
    ))[0]
        .operator
        .clone()
        .unwrap();
    assert_eq!(operator.id, UserId::new("op-1"));
}
