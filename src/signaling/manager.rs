//! Room manager for the Media Signaling Plane: enforces
//! at-most-one-broadcaster, relays SDP/ICE payloads between participants
//! in a room, and buffers ICE candidates addressed to a peer that hasn't
//! joined yet. Sharded one `parking_lot::Mutex` per room so rooms never
//! contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::SignalingError;
use crate::model::{Participant, ParticipantId, Role, Room, SessionId};

/// A message the manager pushes to a participant's connection handler for
/// delivery over its WebSocket.
#[derive(Clone, Debug)]
pub enum OutgoingMessage {
    Relayed { from: ParticipantId, payload: Value },
    PeerLeft { participant_id: ParticipantId },
    ProducerGone,
}

struct RoomState {
    room: Room,
    outboxes: HashMap<ParticipantId, mpsc::Sender<OutgoingMessage>>,
}

pub struct RoomManager {
    rooms: DashMap<SessionId, Arc<Mutex<RoomState>>>,
    grace: Duration,
}

impl RoomManager {
    pub fn new(grace: Duration) -> Self {
        RoomManager { rooms: DashMap::new(), grace }
    }

    fn room_handle(&self, session_id: SessionId) -> Arc<Mutex<RoomState>> {
        self.rooms
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(RoomState { room: Room::default(), outboxes: HashMap::new() })))
            .clone()
    }

    /// Joins `session_id` with the given role, returning the participant
    /// id, a snapshot of the participants already in the room, and the
    /// receiving half of its outbox. Rejects a second broadcaster with
    /// `BroadcasterPresent`.
    ///
    /// `rejoin_as` lets a reconnecting client keep the same participant
    /// id it was assigned before (learned out-of-band, e.g. from its own
    /// prior join response), so candidates a peer addressed to it while
    /// it was briefly disconnected are replayed rather than lost.
    pub fn join(
        &self,
        session_id: SessionId,
        role: Role,
        rejoin_as: Option<ParticipantId>,
    ) -> Result<(ParticipantId, Vec<Participant>, mpsc::Receiver<OutgoingMessage>), SignalingError> {
        let handle = self.room_handle(session_id);
        let mut state = handle.lock();
        if role == Role::Broadcaster && state.room.has_broadcaster() {
            return Err(SignalingError::BroadcasterPresent);
        }

        let existing: Vec<Participant> = state.room.participants.values().cloned().collect();

        let participant_id = rejoin_as.unwrap_or_else(ParticipantId::new);
        state.room.participants.insert(participant_id, Participant { id: participant_id, role });
        let (tx, rx) = mpsc::channel(64);
        state.outboxes.insert(participant_id, tx.clone());

        // Replay anything buffered for this participant before it joined.
        let buffered: Vec<(ParticipantId, Value)> = state
            .room
            .pending_candidates
            .keys()
            .filter(|(_, to)| *to == participant_id)
            .map(|(from, to)| (*from, *to))
            .collect::<Vec<_>>()
            .into_iter()
            .flat_map(|(from, to)| {
                state
                    .room
                    .drain_candidates(from, to)
                    .into_iter()
                    .map(move |payload| (from, payload))
            })
            .collect();
        drop(state);
        for (from, payload) in buffered {
            let _ = tx.try_send(OutgoingMessage::Relayed { from, payload });
        }

        info!(%session_id, %participant_id, ?role, "participant joined");
        Ok((participant_id, existing, rx))
    }

    /// Forwards a signaling payload from `from` to `to`. If `to` hasn't
    /// joined yet, the payload is buffered and replayed on join. Ordering
    /// is preserved per ordered pair, never reordered relative to itself.
    pub async fn relay(&self, session_id: SessionId, from: ParticipantId, to: ParticipantId, payload: Value) -> Result<(), SignalingError> {
        let handle = self.room_handle(session_id);
        let outbox = {
            let mut state = handle.lock();
            if !state.room.participants.contains_key(&from) {
                return Err(SignalingError::PeerUnknown);
            }
            match state.outboxes.get(&to) {
                Some(tx) => Some(tx.clone()),
                None => {
                    state.room.buffer_candidate(from, to, payload.clone());
                    None
                }
            }
        };
        if let Some(tx) = outbox {
            let _ = tx.send(OutgoingMessage::Relayed { from, payload }).await;
        }
        Ok(())
    }

    /// Removes `participant_id` from its room. A departing broadcaster
    /// keeps the room alive for `self.grace` so a reconnect can resume
    /// it; viewers instead get an immediate `peer-left`.
    pub async fn leave(&self, session_id: SessionId, participant_id: ParticipantId) {
        let handle = self.room_handle(session_id);
        let (was_broadcaster, remaining_outboxes) = {
            let mut state = handle.lock();
            let removed = state.room.participants.remove(&participant_id);
            state.outboxes.remove(&participant_id);
            let was_broadcaster = matches!(removed, Some(Participant { role: Role::Broadcaster, .. }));
            (was_broadcaster, state.outboxes.values().cloned().collect::<Vec<_>>())
        };

        let message = if was_broadcaster { OutgoingMessage::ProducerGone } else { OutgoingMessage::PeerLeft { participant_id } };
        for tx in remaining_outboxes {
            let _ = tx.send(message.clone()).await;
        }

        if was_broadcaster {
            self.schedule_grace_sweep(session_id);
        }
    }

    fn schedule_grace_sweep(&self, session_id: SessionId) {
        let grace = self.grace;
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(handle) = rooms.get(&session_id) {
                let mut state = handle.lock();
                if !state.room.has_broadcaster() {
                    state.room.participants.clear();
                    state.outboxes.clear();
                    drop(state);
                    rooms.remove(&session_id);
                    warn!(%session_id, "room torn down after broadcaster grace window elapsed");
                }
            }
        });
    }

    pub fn participant_count(&self, session_id: SessionId) -> usize {
        self.rooms.get(&session_id).map(|h| h.lock().room.participants.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_broadcaster_is_rejected() {
        let manager = RoomManager::new(Duration::from_millis(50));
        let session_id = SessionId::new();
        manager.join(session_id, Role::Broadcaster, None).unwrap();
        let result = manager.join(session_id, Role::Broadcaster, None);
        assert!(matches!(result, Err(SignalingError::BroadcasterPresent)));
    }

    #[tokio::test]
    async fn relay_buffers_for_a_briefly_disconnected_peer() {
        let manager = RoomManager::new(Duration::from_millis(50));
        let session_id = SessionId::new();
        let (broadcaster, _existing, _rx) = manager.join(session_id, Role::Broadcaster, None).unwrap();
        let (viewer, existing, rx) = manager.join(session_id, Role::Viewer, None).unwrap();
        assert_eq!(existing.len(), 1);
        manager.leave(session_id, viewer).await;
        drop(rx);

        manager.relay(session_id, broadcaster, viewer, serde_json::json!({"candidate": "a"})).await.unwrap();

        let (rejoined, _existing, mut rx2) = manager.join(session_id, Role::Viewer, Some(viewer)).unwrap();
        assert_eq!(rejoined, viewer);
        match rx2.recv().await.unwrap() {
            OutgoingMessage::Relayed { payload, .. } => assert_eq!(payload, serde_json::json!({"candidate": "a"})),
            other => panic!("expected replayed relay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcaster_departure_preserves_room_during_grace() {
        let manager = RoomManager::new(Duration::from_millis(30));
        let session_id = SessionId::new();
        let (broadcaster, _existing, _rx) = manager.join(session_id, Role::Broadcaster, None).unwrap();
        let (_viewer, _existing, mut viewer_rx) = manager.join(session_id, Role::Viewer, None).unwrap();

        manager.leave(session_id, broadcaster).await;
        match viewer_rx.recv().await.unwrap() {
            OutgoingMessage::ProducerGone => {}
            other => panic!("expected producer-gone, got {other:?}"),
        }
        assert!(manager.participant_count(session_id) >= 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        // A fresh broadcaster can join again since the generation's room
        // was torn down and recreated on demand.
        manager.join(session_id, Role::Broadcaster, None).unwrap();
    }

    #[tokio::test]
    async fn viewer_departure_notifies_remaining_participants_immediately() {
        let manager = RoomManager::new(Duration::from_millis(50));
        let session_id = SessionId::new();
        let (_broadcaster, _existing, mut broadcaster_rx) = manager.join(session_id, Role::Broadcaster, None).unwrap();
        let (viewer, _existing, _rx) = manager.join(session_id, Role::Viewer, None).unwrap();

        manager.leave(session_id, viewer).await;
        match broadcaster_rx.recv().await.unwrap() {
            OutgoingMessage::PeerLeft { participant_id } => assert_eq!(participant_id, viewer),
            other => panic!("expected peer-left, got {other:?}"),
        }
    }
}
