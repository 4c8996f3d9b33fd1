//! Room registry and handoff state machine.
//!
//! Every known room carries its summary (handoff state, assigned operator,
//! preview, unread aggregate). Handoff state has exactly one mutation point:
//! [`RoomRegistry::apply_state_update`], fed by inbound state frames.
//! Local handoff actions are only *requests*; [`RoomRegistry::check_request`]
//! validates them against the caller's role and the current state before
//! anything is sent, and the room changes when the server's answer arrives.
//!
//! # Handoff transitions
//!
//! ```text
//! AutomatedActive ──request──▶ WaitingForOperator ──accept──▶ OperatorActive
//!       ▲   │                        │                             │
//!       │   └────────intervene───────┼────────────────────────────▶│
//!       └──────────cancel────────────┘◀──────────return────────────┘
//! ```
//!
//! `OperatorActive → WaitingForOperator` is never allowed.

use std::collections::BTreeMap;

use concierge_proto::action::ClientAction;
use concierge_proto::event::{RoomPreview, RoomStateUpdate};
use concierge_proto::message::{
    HandoffState, OperatorInfo, Role, RoomCode, RoomSummary, Timestamp, UserId,
};

/// A handoff action a participant can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffRequest {
    /// End user asks for a human.
    Request,
    /// End user withdraws the request.
    Cancel,
    /// Hand the room back to the automated agent.
    Return,
    /// Operator takes over from the automated agent.
    Intervene,
    /// Operator accepts a waiting handoff.
    Accept,
}

impl HandoffRequest {
    /// The outbound action for `room`.
    #[must_use]
    pub fn to_action(self, room: &RoomCode) -> ClientAction {
        let room_code = room.clone();
        match self {
            Self::Request => ClientAction::RequestHandoff { room_code },
            Self::Cancel => ClientAction::CancelHandoff { room_code },
            Self::Return => ClientAction::RequestAutomatedReturn { room_code },
            Self::Intervene => ClientAction::Intervene { room_code },
            Self::Accept => ClientAction::AcceptHandoff { room_code },
        }
    }

    /// The role allowed to make this request, if only one is.
    const fn required_role(self) -> Option<Role> {
        match self {
            Self::Request | Self::Cancel => Some(Role::EndUser),
            Self::Intervene | Self::Accept => Some(Role::Operator),
            Self::Return => None,
        }
    }

    /// The state the room must be in.
    const fn required_state(self) -> HandoffState {
        match self {
            Self::Request | Self::Intervene => HandoffState::AutomatedActive,
            Self::Cancel | Self::Accept => HandoffState::WaitingForOperator,
            Self::Return => HandoffState::OperatorActive,
        }
    }
}

impl std::fmt::Display for HandoffRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Request => "request handoff",
            Self::Cancel => "cancel handoff",
            Self::Return => "return to automated agent",
            Self::Intervene => "intervene",
            Self::Accept => "accept handoff",
        })
    }
}

/// Local rejections of room actions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// The room is not in the registry.
    #[error("unknown room {0}")]
    UnknownRoom(RoomCode),

    /// An operator tried to send while the automated agent owns the room.
    #[error("the automated agent is handling room {0}; intervene before sending")]
    AutomatedAgentActive(RoomCode),

    /// An operator tried to send into a room assigned to someone else.
    #[error("room {room} is assigned to operator {assigned}")]
    AssignedToOtherOperator {
        /// The room.
        room: RoomCode,
        /// The operator who owns it.
        assigned: UserId,
    },

    /// The caller's role may not make this request.
    #[error("{request} is not available to role {}", .role.as_str())]
    NotPermitted {
        /// What was asked for.
        request: HandoffRequest,
        /// The caller's role.
        role: Role,
    },

    /// The room is not in the state the request needs.
    #[error("cannot {request} while room is {state}")]
    InvalidRequest {
        /// What was asked for.
        request: HandoffRequest,
        /// The room's current state.
        state: HandoffState,
    },

    /// The server reported a transition the state machine forbids.
    #[error("room {room}: transition {from} -> {to} is not allowed")]
    DisallowedTransition {
        /// The room.
        room: RoomCode,
        /// State before.
        from: HandoffState,
        /// Proposed state.
        to: HandoffState,
    },
}

impl RoomError {
    /// Whether this is a permission problem (as opposed to a bad request).
    #[must_use]
    pub const fn is_permission(&self) -> bool {
        matches!(
            self,
            Self::AutomatedAgentActive(_) | Self::AssignedToOtherOperator { .. } | Self::NotPermitted { .. }
        )
    }
}

/// Result of applying a state update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    /// The handoff state changed.
    Transitioned {
        /// State before.
        from: HandoffState,
        /// State after.
        to: HandoffState,
    },
    /// Same state; operator metadata or timestamp refreshed.
    Refreshed,
    /// Older than the last applied update; ignored.
    Stale,
}

impl StateOutcome {
    /// Whether the "needs attention" signal was raised (`Some(true)`),
    /// cleared (`Some(false)`) or untouched (`None`).
    #[must_use]
    pub fn attention_change(&self) -> Option<bool> {
        match self {
            Self::Transitioned { from, to } if from != to => {
                if *to == HandoffState::WaitingForOperator {
                    Some(true)
                } else if *from == HandoffState::WaitingForOperator {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct RoomEntry {
    summary: RoomSummary,
    last_update_at: Option<Timestamp>,
}

/// All rooms known to the session.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<RoomCode, RoomEntry>,
}

fn empty_summary(room: &RoomCode) -> RoomSummary {
    RoomSummary {
        room_code: room.clone(),
        handoff_state: HandoffState::default(),
        operator: None,
        last_message_preview: None,
        last_message_at: None,
        unread_count: 0,
    }
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a room from an authoritative snapshot.
    ///
    /// Snapshots come from the REST room list and may move the handoff state
    /// in any direction, since they are how a rejected transition is resolved.
    pub fn upsert_summary(&mut self, summary: RoomSummary) -> StateOutcome {
        let room = summary.room_code.clone();
        match self.rooms.get_mut(&room) {
            Some(entry) => {
                let from = entry.summary.handoff_state;
                let to = summary.handoff_state;
                entry.summary = summary;
                if from == to {
                    StateOutcome::Refreshed
                } else {
                    StateOutcome::Transitioned { from, to }
                }
            }
            None => {
                let from = HandoffState::default();
                let to = summary.handoff_state;
                self.rooms.insert(
                    room,
                    RoomEntry {
                        summary,
                        last_update_at: None,
                    },
                );
                if from == to {
                    StateOutcome::Refreshed
                } else {
                    StateOutcome::Transitioned { from, to }
                }
            }
        }
    }

    /// Add a placeholder entry for a room that is not listed yet. Returns
    /// `true` if one was added.
    pub fn ensure(&mut self, room: &RoomCode) -> bool {
        if self.rooms.contains_key(room) {
            return false;
        }
        self.rooms.insert(
            room.clone(),
            RoomEntry {
                summary: empty_summary(room),
                last_update_at: None,
            },
        );
        true
    }

    /// Apply an inbound state update. The only place live frames change a
    /// room's handoff state.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::DisallowedTransition`] for
    /// `OperatorActive → WaitingForOperator`; the room is left unchanged.
    pub fn apply_state_update(
        &mut self,
        room: &RoomCode,
        update: &RoomStateUpdate,
    ) -> Result<StateOutcome, RoomError> {
        let entry = self.rooms.entry(room.clone()).or_insert_with(|| RoomEntry {
            summary: empty_summary(room),
            last_update_at: None,
        });

        if entry.last_update_at.is_some_and(|last| update.timestamp < last) {
            tracing::debug!(room = %room, "ignoring stale state update");
            return Ok(StateOutcome::Stale);
        }

        let from = entry.summary.handoff_state;
        let to = update.current;
        if !from.can_transition_to(to) {
            return Err(RoomError::DisallowedTransition {
                room: room.clone(),
                from,
                to,
            });
        }

        entry.last_update_at = Some(update.timestamp);
        entry.summary.handoff_state = to;
        match to {
            HandoffState::AutomatedActive => entry.summary.operator = None,
            _ => {
                if let Some(operator) = &update.admin_info {
                    entry.summary.operator = Some(operator.clone());
                }
            }
        }

        if from == to {
            Ok(StateOutcome::Refreshed)
        } else {
            tracing::info!(room = %room, %from, %to, "handoff state changed");
            Ok(StateOutcome::Transitioned { from, to })
        }
    }

    /// Record an operator assignment change. Returns `false` for unknown rooms.
    pub fn apply_assignment(&mut self, room: &RoomCode, operator: Option<OperatorInfo>) -> bool {
        match self.rooms.get_mut(room) {
            Some(entry) => {
                entry.summary.operator = operator;
                true
            }
            None => false,
        }
    }

    /// Apply a room-list preview. Unknown rooms are added.
    pub fn apply_preview(&mut self, preview: &RoomPreview) {
        let entry = self
            .rooms
            .entry(preview.room_code.clone())
            .or_insert_with(|| RoomEntry {
                summary: empty_summary(&preview.room_code),
                last_update_at: None,
            });
        if preview.last_message_preview.is_some() {
            entry.summary.last_message_preview.clone_from(&preview.last_message_preview);
        }
        if preview.last_message_at.is_some() {
            entry.summary.last_message_at = preview.last_message_at;
        }
        if let Some(count) = preview.unread_count {
            entry.summary.unread_count = count;
        }
    }

    /// Update the preview from a live message.
    pub fn note_message(&mut self, room: &RoomCode, content: &str, at: Timestamp) {
        if let Some(entry) = self.rooms.get_mut(room) {
            entry.summary.last_message_preview = Some(content.to_string());
            entry.summary.last_message_at = Some(at);
        }
    }

    /// Set a room's unread aggregate.
    pub fn set_unread(&mut self, room: &RoomCode, count: u32) {
        if let Some(entry) = self.rooms.get_mut(room) {
            entry.summary.unread_count = count;
        }
    }

    /// Check a handoff request against role and state.
    ///
    /// # Errors
    ///
    /// [`RoomError::UnknownRoom`], [`RoomError::NotPermitted`] or
    /// [`RoomError::InvalidRequest`].
    pub fn check_request(
        &self,
        room: &RoomCode,
        role: Role,
        request: HandoffRequest,
    ) -> Result<ClientAction, RoomError> {
        let state = self.state(room).ok_or_else(|| RoomError::UnknownRoom(room.clone()))?;
        if request.required_role().is_some_and(|required| required != role) {
            return Err(RoomError::NotPermitted { request, role });
        }
        if state != request.required_state() {
            return Err(RoomError::InvalidRequest { request, state });
        }
        Ok(request.to_action(room))
    }

    /// Check whether `user` in `role` may send into `room` right now.
    ///
    /// # Errors
    ///
    /// [`RoomError::UnknownRoom`], [`RoomError::AutomatedAgentActive`] or
    /// [`RoomError::AssignedToOtherOperator`].
    pub fn check_send(&self, room: &RoomCode, user: &UserId, role: Role) -> Result<(), RoomError> {
        let entry = self
            .rooms
            .get(room)
            .ok_or_else(|| RoomError::UnknownRoom(room.clone()))?;
        if role == Role::EndUser {
            return Ok(());
        }
        if entry.summary.handoff_state == HandoffState::AutomatedActive {
            return Err(RoomError::AutomatedAgentActive(room.clone()));
        }
        match &entry.summary.operator {
            Some(operator) if operator.id != *user => Err(RoomError::AssignedToOtherOperator {
                room: room.clone(),
                assigned: operator.id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// A room's summary.
    #[must_use]
    pub fn get(&self, room: &RoomCode) -> Option<&RoomSummary> {
        self.rooms.get(room).map(|e| &e.summary)
    }

    /// A room's handoff state.
    #[must_use]
    pub fn state(&self, room: &RoomCode) -> Option<HandoffState> {
        self.get(room).map(|s| s.handoff_state)
    }

    /// Whether the room is waiting for an operator.
    #[must_use]
    pub fn needs_attention(&self, room: &RoomCode) -> bool {
        self.state(room) == Some(HandoffState::WaitingForOperator)
    }

    /// Rooms currently waiting for an operator.
    pub fn attention_rooms(&self) -> impl Iterator<Item = &RoomCode> {
        self.rooms
            .iter()
            .filter(|(_, e)| e.summary.handoff_state == HandoffState::WaitingForOperator)
            .map(|(code, _)| code)
    }

    /// Every summary, ordered by room code.
    pub fn summaries(&self) -> impl Iterator<Item = &RoomSummary> {
        self.rooms.values().map(|e| &e.summary)
    }

    /// Whether the room is known.
    #[must_use]
    pub fn contains(&self, room: &RoomCode) -> bool {
        self.rooms.contains_key(room)
    }

    /// Forget a room.
    pub fn remove(&mut self, room: &RoomCode) -> Option<RoomSummary> {
        self.rooms.remove(room).map(|e| e.summary)
    }

    /// Number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether there are no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomCode {
        RoomCode::new("R1")
    }

    fn operator(id: &str) -> OperatorInfo {
        OperatorInfo {
            id: UserId::new(id),
            display_name: format!("Operator {id}"),
            last_activity_at: None,
        }
    }

    fn update(current: HandoffState, at: u64) -> RoomStateUpdate {
        RoomStateUpdate {
            current,
            admin_info: None,
            transition_reason: None,
            timestamp: Timestamp::from_millis(at),
        }
    }

    fn registry() -> RoomRegistry {
        let mut rooms = RoomRegistry::new();
        rooms.upsert_summary(empty_summary(&room()));
        rooms
    }

    #[test]
    fn full_handoff_cycle() {
        let mut rooms = registry();
        assert_eq!(rooms.state(&room()), Some(HandoffState::AutomatedActive));

        let out = rooms
            .apply_state_update(&room(), &update(HandoffState::WaitingForOperator, 10))
            .unwrap();
        assert_eq!(out.attention_change(), Some(true));
        assert!(rooms.needs_attention(&room()));

        let mut accepted = update(HandoffState::OperatorActive, 20);
        accepted.admin_info = Some(operator("op-1"));
        let out = rooms.apply_state_update(&room(), &accepted).unwrap();
        assert_eq!(out.attention_change(), Some(false));
        assert_eq!(rooms.get(&room()).unwrap().operator, Some(operator("op-1")));

        rooms
            .apply_state_update(&room(), &update(HandoffState::AutomatedActive, 30))
            .unwrap();
        assert_eq!(rooms.get(&room()).unwrap().operator, None);
        assert_eq!(rooms.attention_rooms().count(), 0);
    }

    #[test]
    fn operator_to_waiting_is_rejected() {
        let mut rooms = registry();
        rooms
            .apply_state_update(&room(), &update(HandoffState::OperatorActive, 10))
            .unwrap();
        let err = rooms
            .apply_state_update(&room(), &update(HandoffState::WaitingForOperator, 20))
            .unwrap_err();
        assert!(matches!(err, RoomError::DisallowedTransition { .. }));
        assert_eq!(rooms.state(&room()), Some(HandoffState::OperatorActive));
    }

    #[test]
    fn stale_update_is_ignored() {
        let mut rooms = registry();
        rooms
            .apply_state_update(&room(), &update(HandoffState::WaitingForOperator, 20))
            .unwrap();
        let out = rooms
            .apply_state_update(&room(), &update(HandoffState::AutomatedActive, 10))
            .unwrap();
        assert_eq!(out, StateOutcome::Stale);
        assert_eq!(rooms.state(&room()), Some(HandoffState::WaitingForOperator));
    }

    #[test]
    fn same_state_refreshes_operator() {
        let mut rooms = registry();
        rooms
            .apply_state_update(&room(), &update(HandoffState::OperatorActive, 10))
            .unwrap();
        let mut refreshed = update(HandoffState::OperatorActive, 15);
        refreshed.admin_info = Some(operator("op-2"));
        assert_eq!(
            rooms.apply_state_update(&room(), &refreshed).unwrap(),
            StateOutcome::Refreshed
        );
        assert_eq!(rooms.get(&room()).unwrap().operator, Some(operator("op-2")));
    }

    #[test]
    fn requests_are_checked_against_role_and_state() {
        let rooms = registry();
        assert!(matches!(
            rooms.check_request(&room(), Role::EndUser, HandoffRequest::Request),
            Ok(ClientAction::RequestHandoff { .. })
        ));
        assert!(matches!(
            rooms.check_request(&room(), Role::Operator, HandoffRequest::Intervene),
            Ok(ClientAction::Intervene { .. })
        ));
        assert_eq!(
            rooms.check_request(&room(), Role::Operator, HandoffRequest::Request),
            Err(RoomError::NotPermitted {
                request: HandoffRequest::Request,
                role: Role::Operator
            })
        );
        assert_eq!(
            rooms.check_request(&room(), Role::EndUser, HandoffRequest::Cancel),
            Err(RoomError::InvalidRequest {
                request: HandoffRequest::Cancel,
                state: HandoffState::AutomatedActive
            })
        );
        assert!(matches!(
            rooms.check_request(&RoomCode::new("nope"), Role::EndUser, HandoffRequest::Request),
            Err(RoomError::UnknownRoom(_))
        ));
    }

    #[test]
    fn operator_send_guards() {
        let mut rooms = registry();
        let me = UserId::new("op-1");
        assert_eq!(
            rooms.check_send(&room(), &me, Role::Operator),
            Err(RoomError::AutomatedAgentActive(room()))
        );
        assert!(rooms.check_send(&room(), &UserId::new("u-1"), Role::EndUser).is_ok());

        let mut taken = update(HandoffState::OperatorActive, 10);
        taken.admin_info = Some(operator("op-2"));
        rooms.apply_state_update(&room(), &taken).unwrap();
        assert!(matches!(
            rooms.check_send(&room(), &me, Role::Operator),
            Err(RoomError::AssignedToOtherOperator { .. })
        ));
        assert!(rooms.check_send(&room(), &UserId::new("op-2"), Role::Operator).is_ok());
    }

    #[test]
    fn snapshot_can_resolve_any_state() {
        let mut rooms = registry();
        rooms
            .apply_state_update(&room(), &update(HandoffState::OperatorActive, 10))
            .unwrap();
        let mut snapshot = empty_summary(&room());
        snapshot.handoff_state = HandoffState::WaitingForOperator;
        assert_eq!(
            rooms.upsert_summary(snapshot),
            StateOutcome::Transitioned {
                from: HandoffState::OperatorActive,
                to: HandoffState::WaitingForOperator
            }
        );
    }

    #[test]
    fn previews_update_summary() {
        let mut rooms = registry();
        rooms.apply_preview(&RoomPreview {
            room_code: room(),
            last_message_preview: Some("see you at the gate".into()),
            last_message_at: Some(Timestamp::from_millis(5)),
            unread_count: Some(3),
        });
        let summary = rooms.get(&room()).unwrap();
        assert_eq!(summary.last_message_preview.as_deref(), Some("see you at the gate"));
        assert_eq!(summary.unread_count, 3);
    }
}
