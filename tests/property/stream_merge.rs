//! Property-based tests for the message stream.
//!
//! Uses proptest to verify:
//! 1. Live messages arriving in any order, with repeats, end up sorted by
//!    sequence number with no duplicates.
//! 2. A history page and live deliveries that overlap converge to the same
//!    stream whichever order they are applied in.
//! 3. Restoring a scroll anchor keeps the distance from the bottom fixed.

use concierge::config::ChatConfig;
use concierge::stream::{MessageStream, ScrollAnchor, Viewport};
use concierge_proto::message::*;
use proptest::prelude::*;
use tokio::time::Instant;

fn message(seq: u64) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(format!("m-{seq}")),
        room_code: RoomCode::new("R1"),
        seq: Seq::new(seq),
        sender_id: UserId::new("agent"),
        sender_type: SenderType::Automated,
        content: format!("message {seq}"),
        sent_at: Timestamp::from_millis(seq * 1000),
        unread_count: 0,
        client_ref: None,
    }
}

fn loaded_stream(page: Vec<ChatMessage>) -> MessageStream {
    let mut stream = MessageStream::new(RoomCode::new("R1"), &ChatConfig::default());
    let request = stream.begin_initial();
    stream
        .apply_initial(
            request.generation,
            MessagePage {
                items: page,
                is_last_page: true,
            },
        )
        .unwrap();
    stream
}

fn seqs(stream: &MessageStream) -> Vec<u64> {
    stream.messages().iter().map(|m| m.seq.value()).collect()
}

/// A set of sequence numbers and a delivery order over it, with repeats.
fn arb_deliveries() -> impl Strategy<Value = (Vec<u64>, Vec<u64>)> {
    prop::collection::btree_set(1u64..200, 1..30).prop_flat_map(|set| {
        let unique: Vec<u64> = set.into_iter().collect();
        let len = unique.len();
        (
            Just(unique.clone()),
            prop::collection::vec(prop::sample::select(unique.clone()), len..len * 2)
                .prop_flat_map(move |extra| {
                    let mut all = extra;
                    all.extend(unique.iter().copied());
                    Just(all).prop_shuffle()
                }),
        )
    })
}

proptest! {
    #[test]
    fn live_messages_converge_to_sorted_unique((unique, order) in arb_deliveries()) {
        let mut stream = loaded_stream(Vec::new());
        for seq in order {
            stream.merge_live(message(seq), None, Instant::now());
        }
        prop_assert_eq!(seqs(&stream), unique);
    }

    #[test]
    fn page_and_live_order_do_not_matter(
        (unique, order) in arb_deliveries(),
        split in 0usize..30,
    ) {
        let split = split.min(unique.len());
        let page: Vec<ChatMessage> = unique[split..].iter().rev().map(|s| message(*s)).collect();

        let mut page_first = loaded_stream(page.clone());
        for seq in &order {
            page_first.merge_live(message(*seq), None, Instant::now());
        }

        let mut live_first = loaded_stream(Vec::new());
        for seq in &order {
            live_first.merge_live(message(*seq), None, Instant::now());
        }
        live_first.reconcile(MessagePage { items: page, is_last_page: true });

        prop_assert_eq!(seqs(&page_first), unique.clone());
        prop_assert_eq!(seqs(&live_first), unique);
    }

    #[test]
    fn anchor_keeps_distance_from_bottom(
        scroll_top in 0.0f64..5000.0,
        extra in 0.0f64..5000.0,
        client_height in 100.0f64..1000.0,
    ) {
        let scroll_height = scroll_top + client_height + 10.0;
        let viewport = Viewport { scroll_top, scroll_height, client_height };
        let anchor = ScrollAnchor::capture(&viewport);
        let new_height = scroll_height + extra;
        let restored = anchor.restore(new_height);
        prop_assert!(((new_height - restored) - (scroll_height - scroll_top)).abs() < 1e-6);
        prop_assert!(restored >= scroll_top);
    }
}
