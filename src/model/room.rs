//! Media rendezvous entities for the Signaling Plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        ParticipantId(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Broadcaster,
    Viewer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
}

/// Room-scoped rendezvous object keyed by session id. Holds at most one
/// producer participant and zero-or-more viewers. Each
/// room owns its own participant map so the signaling plane's per-room
/// lock never has to reach across rooms.
#[derive(Debug, Default)]
pub struct Room {
    pub participants: HashMap<ParticipantId, Participant>,
    /// ICE candidates that arrived before the remote description was set,
    /// buffered per ordered (from, to) pair and replayed on application.
    pub pending_candidates: HashMap<(ParticipantId, ParticipantId), Vec<serde_json::Value>>,
}

impl Room {
    pub fn broadcaster(&self) -> Option<&Participant> {
        self.participants.values().find(|p| p.role == Role::Broadcaster)
    }

    pub fn has_broadcaster(&self) -> bool {
        self.broadcaster().is_some()
    }

    pub fn viewers(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values().filter(|p| p.role == Role::Viewer)
    }

    pub fn buffer_candidate(&mut self, from: ParticipantId, to: ParticipantId, candidate: serde_json::Value) {
        self.pending_candidates.entry((from, to)).or_default().push(candidate);
    }

    /// Drains and returns buffered candidates in arrival order for replay
    /// once the remote description has been applied.
    pub fn drain_candidates(&mut self, from: ParticipantId, to: ParticipantId) -> Vec<serde_json::Value> {
        self.pending_candidates.remove(&(from, to)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_replay_in_arrival_order() {
        let mut room = Room::default();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        room.buffer_candidate(a, b, serde_json::json!({"n": 1}));
        room.buffer_candidate(a, b, serde_json::json!({"n": 2}));
        let drained = room.drain_candidates(a, b);
        assert_eq!(drained, vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
    }

    #[test]
    fn at_most_one_broadcaster_is_enforced_by_caller_not_the_struct() {
        // Room itself is a dumb container; RoomManager enforces the
        // at-most-one-broadcaster invariant before inserting.
        let mut room = Room::default();
        assert!(!room.has_broadcaster());
        room.participants.insert(
            ParticipantId::new(),
            Participant { id: ParticipantId::new(), role: Role::Broadcaster },
        );
        assert!(room.has_broadcaster());
    }
}
