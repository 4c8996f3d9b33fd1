//! Client actions sent as `SEND` frames to application destinations.
//!
//! Each action maps to one destination under `/app/` and a small JSON body.
//! The broker uses [`ClientAction::parse`] to go the other way.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::frame::Frame;
use crate::message::{RoomCode, Seq};

const ROOM_PREFIX: &str = "/app/chat/";
const UNREAD_DESTINATION: &str = "/app/unread";

/// An action a session asks the server to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Announce presence in a room.
    JoinRoom {
        /// Target room.
        room_code: RoomCode,
    },
    /// Post a chat message.
    SendMessage {
        /// Target room.
        room_code: RoomCode,
        /// Message text.
        content: String,
        /// Correlation id echoed on the confirmed message.
        client_ref: Option<String>,
    },
    /// End user asks for a human operator.
    RequestHandoff {
        /// Target room.
        room_code: RoomCode,
    },
    /// End user withdraws a pending handoff request.
    CancelHandoff {
        /// Target room.
        room_code: RoomCode,
    },
    /// Hand the room back to the automated agent.
    RequestAutomatedReturn {
        /// Target room.
        room_code: RoomCode,
    },
    /// Operator takes over from the automated agent.
    Intervene {
        /// Target room.
        room_code: RoomCode,
    },
    /// Operator accepts a waiting handoff.
    AcceptHandoff {
        /// Target room.
        room_code: RoomCode,
    },
    /// Advance the caller's read cursor.
    MarkRead {
        /// Target room.
        room_code: RoomCode,
        /// Highest sequence the caller has seen.
        last_read_seq: Seq,
    },
    /// Ask for a fresh unread aggregate on the unread queue.
    RequestUnreadCount,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody {
    last_read_seq: Seq,
}

impl ClientAction {
    /// Room the action targets, if any.
    #[must_use]
    pub const fn room_code(&self) -> Option<&RoomCode> {
        match self {
            Self::JoinRoom { room_code }
            | Self::SendMessage { room_code, .. }
            | Self::RequestHandoff { room_code }
            | Self::CancelHandoff { room_code }
            | Self::RequestAutomatedReturn { room_code }
            | Self::Intervene { room_code }
            | Self::AcceptHandoff { room_code }
            | Self::MarkRead { room_code, .. } => Some(room_code),
            Self::RequestUnreadCount => None,
        }
    }

    /// Destination path the action is sent to.
    #[must_use]
    pub fn destination(&self) -> String {
        let suffix = match self {
            Self::JoinRoom { .. } => "join",
            Self::SendMessage { .. } => "send",
            Self::RequestHandoff { .. } => "handoff/request",
            Self::CancelHandoff { .. } => "handoff/cancel",
            Self::RequestAutomatedReturn { .. } => "handoff/return",
            Self::Intervene { .. } => "handoff/intervene",
            Self::AcceptHandoff { .. } => "handoff/accept",
            Self::MarkRead { .. } => "read",
            Self::RequestUnreadCount => return UNREAD_DESTINATION.to_string(),
        };
        match self.room_code() {
            Some(room) => format!("{ROOM_PREFIX}{room}/{suffix}"),
            None => UNREAD_DESTINATION.to_string(),
        }
    }

    /// JSON body of the action.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if serialization fails.
    pub fn body(&self) -> Result<String, CodecError> {
        Ok(match self {
            Self::SendMessage {
                content,
                client_ref,
                ..
            } => serde_json::to_string(&SendBody {
                content: content.clone(),
                client_ref: client_ref.clone(),
            })?,
            Self::MarkRead { last_read_seq, .. } => serde_json::to_string(&ReadBody {
                last_read_seq: *last_read_seq,
            })?,
            _ => "{}".to_string(),
        })
    }

    /// Build the `SEND` frame for this action.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Json`] if the body cannot be serialized.
    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        Ok(Frame::send(&self.destination(), self.body()?))
    }

    /// Parse an action from a `SEND` destination and body.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownDestination`] for paths that do not name
    /// an action, and [`CodecError::Json`] for malformed bodies.
    pub fn parse(destination: &str, body: &str) -> Result<Self, CodecError> {
        if destination == UNREAD_DESTINATION {
            return Ok(Self::RequestUnreadCount);
        }
        let unknown = || CodecError::UnknownDestination(destination.to_string());
        let rest = destination.strip_prefix(ROOM_PREFIX).ok_or_else(unknown)?;
        let (room, suffix) = rest.split_once('/').ok_or_else(unknown)?;
        let room_code = RoomCode::new(room);
        if !room_code.is_routable() {
            return Err(unknown());
        }
        Ok(match suffix {
            "join" => Self::JoinRoom { room_code },
            "send" => {
                let body: SendBody = serde_json::from_str(body)?;
                Self::SendMessage {
                    room_code,
                    content: body.content,
                    client_ref: body.client_ref,
                }
            }
            "handoff/request" => Self::RequestHandoff { room_code },
            "handoff/cancel" => Self::CancelHandoff { room_code },
            "handoff/return" => Self::RequestAutomatedReturn { room_code },
            "handoff/intervene" => Self::Intervene { room_code },
            "handoff/accept" => Self::AcceptHandoff { room_code },
            "read" => {
                let body: ReadBody = serde_json::from_str(body)?;
                Self::MarkRead {
                    room_code,
                    last_read_seq: body.last_read_seq,
                }
            }
            _ => return Err(unknown()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Command;

    fn room() -> RoomCode {
        RoomCode::new("R1")
    }

    #[test]
    fn destinations_are_room_scoped() {
        assert_eq!(
            ClientAction::RequestHandoff { room_code: room() }.destination(),
            "/app/chat/R1/handoff/request"
        );
        assert_eq!(
            ClientAction::MarkRead {
                room_code: room(),
                last_read_seq: Seq::new(3)
            }
            .destination(),
            "/app/chat/R1/read"
        );
        assert_eq!(ClientAction::RequestUnreadCount.destination(), "/app/unread");
    }

    #[test]
    fn send_frame_carries_content_and_client_ref() {
        let action = ClientAction::SendMessage {
            room_code: room(),
            content: "hello".into(),
            client_ref: Some("tmp-1".into()),
        };
        let frame = action.to_frame().unwrap();
        assert_eq!(frame.command, Command::Send);
        assert_eq!(frame.destination(), Some("/app/chat/R1/send"));
        assert_eq!(frame.body, r#"{"content":"hello","clientRef":"tmp-1"}"#);
    }

    #[test]
    fn parse_inverts_destination_and_body() {
        let actions = [
            ClientAction::JoinRoom { room_code: room() },
            ClientAction::SendMessage {
                room_code: room(),
                content: "x".into(),
                client_ref: None,
            },
            ClientAction::CancelHandoff { room_code: room() },
            ClientAction::RequestAutomatedReturn { room_code: room() },
            ClientAction::Intervene { room_code: room() },
            ClientAction::AcceptHandoff { room_code: room() },
            ClientAction::MarkRead {
                room_code: room(),
                last_read_seq: Seq::new(12),
            },
            ClientAction::RequestUnreadCount,
        ];
        for action in actions {
            let parsed = ClientAction::parse(&action.destination(), &action.body().unwrap()).unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn parse_rejects_unknown_paths() {
        assert!(matches!(
            ClientAction::parse("/app/chat/R1/dance", "{}"),
            Err(CodecError::UnknownDestination(_))
        ));
        assert!(matches!(
            ClientAction::parse("/app/other", "{}"),
            Err(CodecError::UnknownDestination(_))
        ));
        assert!(matches!(
            ClientAction::parse("/app/chat/R1/send", "{}"),
            Err(CodecError::Json(_))
        ));
    }
}
