//! JSON envelope codec for server events.
//!
//! The envelope is decoded in two steps: first into a loosely typed
//! [`RawEvent`] so the `type` tag can be inspected, then the payload is
//! decoded into the body type that tag names. Unknown tags are reported as
//! [`CodecError::UnknownType`] so callers can skip them without tearing down
//! the link.

use serde::{Deserialize, Serialize};

use crate::event::{
    AdminAssignment, EventBody, EventType, HandoffNotice, ReadStatus, RoomPreview,
    RoomStateUpdate, ServerEvent, ServerNotice, UnreadCounts,
};
use crate::message::ChatMessage;

/// Errors from encoding or decoding JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The body was not valid JSON or did not match the expected shape.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope named an event type this crate does not know.
    #[error("unknown event type: {0}")]
    UnknownType(String),

    /// A `HANDOFF_STATE` event arrived without its `roomState`.
    #[error("HANDOFF_STATE event without roomState")]
    MissingRoomState,

    /// An action destination could not be parsed.
    #[error("unrecognized destination: {0}")]
    UnknownDestination(String),
}

/// The envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Authoritative room state, if attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_state: Option<RoomStateUpdate>,
}

/// Decode a `MESSAGE` frame body into a typed event.
///
/// # Errors
///
/// Returns [`CodecError`] if the JSON is malformed, the type is unknown, or
/// a `HANDOFF_STATE` event lacks its room state.
pub fn decode_event(text: &str) -> Result<ServerEvent, CodecError> {
    let raw: RawEvent = serde_json::from_str(text)?;
    let kind = EventType::parse(&raw.kind).ok_or_else(|| CodecError::UnknownType(raw.kind.clone()))?;
    let payload = raw.payload;
    let body = match kind {
        EventType::ChatMessage => EventBody::ChatMessage(serde_json::from_value::<ChatMessage>(payload)?),
        EventType::SystemMessage => {
            EventBody::SystemMessage(serde_json::from_value::<ChatMessage>(payload)?)
        }
        EventType::AdminAssignment => {
            EventBody::AdminAssignment(serde_json::from_value::<AdminAssignment>(payload)?)
        }
        EventType::HandoffState => {
            if raw.room_state.is_none() {
                return Err(CodecError::MissingRoomState);
            }
            EventBody::HandoffState(serde_json::from_value::<HandoffNotice>(payload)?)
        }
        EventType::ReadStatus => EventBody::ReadStatus(serde_json::from_value::<ReadStatus>(payload)?),
        EventType::RoomPreview => {
            EventBody::RoomPreview(serde_json::from_value::<RoomPreview>(payload)?)
        }
        EventType::UnreadCounts => {
            EventBody::UnreadCounts(serde_json::from_value::<UnreadCounts>(payload)?)
        }
        EventType::Error => EventBody::Error(serde_json::from_value::<ServerNotice>(payload)?),
    };
    Ok(ServerEvent {
        body,
        room_state: raw.room_state,
    })
}

/// Encode a typed event into its JSON envelope.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode_event(event: &ServerEvent) -> Result<String, CodecError> {
    let payload = match &event.body {
        EventBody::ChatMessage(m) | EventBody::SystemMessage(m) => serde_json::to_value(m)?,
        EventBody::AdminAssignment(a) => serde_json::to_value(a)?,
        EventBody::HandoffState(h) => serde_json::to_value(h)?,
        EventBody::ReadStatus(r) => serde_json::to_value(r)?,
        EventBody::RoomPreview(p) => serde_json::to_value(p)?,
        EventBody::UnreadCounts(u) => serde_json::to_value(u)?,
        EventBody::Error(n) => serde_json::to_value(n)?,
    };
    let raw = RawEvent {
        kind: event.kind().as_str().to_string(),
        payload,
        room_state: event.room_state.clone(),
    };
    Ok(serde_json::to_string(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;

    fn sample_message() -> ChatMessage {
        ChatMessage {
            id: MessageId::new("m-1"),
            room_code: RoomCode::new("R1"),
            seq: Seq::new(1),
            sender_id: UserId::new("u-1"),
            sender_type: SenderType::EndUser,
            content: "hello".into(),
            sent_at: Timestamp::from_millis(1_000),
            unread_count: 1,
            client_ref: Some("tmp-1".into()),
        }
    }

    #[test]
    fn decode_chat_message_with_room_state() {
        let text = r#"{
            "type": "CHAT_MESSAGE",
            "payload": {
                "id": "m-9", "roomCode": "R1", "seq": 9, "senderId": "bot",
                "senderType": "AUTOMATED", "content": "hi", "sentAt": 5
            },
            "roomState": { "current": "AUTOMATED_ACTIVE", "timestamp": 5 }
        }"#;
        let event = decode_event(text).unwrap();
        assert_eq!(event.kind(), EventType::ChatMessage);
        assert_eq!(event.room_code(), Some(&RoomCode::new("R1")));
        assert_eq!(
            event.room_state.map(|s| s.current),
            Some(HandoffState::AutomatedActive)
        );
    }

    #[test]
    fn encode_then_decode_preserves_event() {
        let event = ServerEvent::new(EventBody::ChatMessage(sample_message()));
        let text = encode_event(&event).unwrap();
        assert!(text.contains("\"type\":\"CHAT_MESSAGE\""));
        assert_eq!(decode_event(&text).unwrap(), event);
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = decode_event(r#"{"type":"TYPING","payload":{}}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "TYPING"));
    }

    #[test]
    fn handoff_state_requires_room_state() {
        let err = decode_event(r#"{"type":"HANDOFF_STATE","payload":{"roomCode":"R1"}}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::MissingRoomState));
    }

    #[test]
    fn malformed_payload_is_json_error() {
        let err = decode_event(r#"{"type":"READ_STATUS","payload":{"roomCode":1}}"#).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
        assert!(matches!(decode_event("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn unread_counts_payload_is_a_map() {
        let event = decode_event(
            r#"{"type":"UNREAD_COUNTS","payload":{"counts":{"R1":2,"R2":0}}}"#,
        )
        .unwrap();
        match event.body {
            EventBody::UnreadCounts(u) => {
                assert_eq!(u.counts.get(&RoomCode::new("R1")), Some(&2));
                assert_eq!(u.counts.len(), 2);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
