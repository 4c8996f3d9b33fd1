//! Property-based tests for the text-frame and event codecs.
//!
//! Uses proptest to verify:
//! 1. Any frame with arbitrary header text survives encode then decode.
//! 2. Arbitrary input never makes `frame::decode` or `codec::decode_event` panic.
//! 3. Chat message events survive the JSON envelope.

use concierge_proto::codec;
use concierge_proto::event::{EventBody, ServerEvent};
use concierge_proto::frame::{self, Command, Frame};
use concierge_proto::message::*;
use proptest::prelude::*;

/// Strategy for frame commands.
fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::Connect),
        Just(Command::Connected),
        Just(Command::Subscribe),
        Just(Command::Unsubscribe),
        Just(Command::Send),
        Just(Command::Message),
        Just(Command::Receipt),
        Just(Command::Error),
        Just(Command::Disconnect),
    ]
}

/// Header names and values may contain the characters that need escaping.
fn arb_header_text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:\\\\\n\r /_-]{0,24}"
}

/// Strategy for whole frames. Bodies exclude NUL, which terminates a frame.
fn arb_frame() -> impl Strategy<Value = Frame> {
    (
        arb_command(),
        prop::collection::vec((arb_header_text(), arb_header_text()), 0..6),
        "[^\x00]{0,256}",
    )
        .prop_map(|(command, headers, body)| {
            headers
                .into_iter()
                .fold(Frame::new(command), |f, (k, v)| f.with_header(k, v))
                .with_body(body)
        })
}

fn arb_sender_type() -> impl Strategy<Value = SenderType> {
    prop_oneof![
        Just(SenderType::EndUser),
        Just(SenderType::Operator),
        Just(SenderType::Automated),
        Just(SenderType::System),
    ]
}

/// Strategy for confirmed chat messages.
fn arb_chat_message() -> impl Strategy<Value = ChatMessage> {
    (
        "[A-Z0-9]{1,8}",
        any::<u64>(),
        arb_sender_type(),
        ".{0,200}",
        any::<u64>(),
        0u32..2,
        proptest::option::of("tmp-[a-f0-9]{8}"),
    )
        .prop_map(
            |(room, seq, sender_type, content, sent_at, unread_count, client_ref)| ChatMessage {
                id: MessageId::new(format!("m-{seq}")),
                room_code: RoomCode::new(room),
                seq: Seq::new(seq),
                sender_id: UserId::new("u-1"),
                sender_type,
                content,
                sent_at: Timestamp::from_millis(sent_at),
                unread_count,
                client_ref,
            },
        )
}

proptest! {
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let text = frame::encode(&frame);
        let decoded = frame::decode(&text).unwrap();
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn random_text_never_panics_frame_decode(text in ".{0,512}") {
        let _ = frame::decode(&text);
    }

    #[test]
    fn random_text_never_panics_event_decode(text in ".{0,512}") {
        let _ = codec::decode_event(&text);
    }

    #[test]
    fn chat_event_round_trip(message in arb_chat_message()) {
        let event = ServerEvent::new(EventBody::ChatMessage(message));
        let text = codec::encode_event(&event).unwrap();
        prop_assert_eq!(codec::decode_event(&text).unwrap(), event);
    }
}
