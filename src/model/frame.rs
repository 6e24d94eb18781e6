//! `Frame` and `ControlCommand` entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::SessionId;

/// An image payload with metadata. Frames are produced in strictly
/// increasing `(generation, frame_counter)` order; receivers may drop but
/// never reorder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub session_id: SessionId,
    pub generation: u64,
    pub frame_counter: u64,
    pub physics_time: f64,
    pub encoding: String,
    pub bytes: Vec<u8>,
}

/// A stream item the producer loop publishes: either a reset marker or a
/// frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StreamItem {
    Reset { generation: u64 },
    Frame(Frame),
    Faulted,
}

/// Tagged union of control commands. Each carries an
/// idempotency key so repeated delivery (e.g. after a client retry) is
/// applied once.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Reset {
        idempotency_key: Uuid,
    },
    Step {
        idempotency_key: Uuid,
        actions: Vec<f64>,
    },
    Execute {
        idempotency_key: Uuid,
        source: String,
        language: String,
        timeout_ms: u64,
    },
    Play {
        idempotency_key: Uuid,
    },
    Pause {
        idempotency_key: Uuid,
    },
    SetCamera {
        idempotency_key: Uuid,
        distance: f64,
        yaw: f64,
        pitch: f64,
        target: [f64; 3],
    },
}

impl ControlCommand {
    pub fn idempotency_key(&self) -> Uuid {
        match self {
            ControlCommand::Reset { idempotency_key }
            | ControlCommand::Step { idempotency_key, .. }
            | ControlCommand::Execute { idempotency_key, .. }
            | ControlCommand::Play { idempotency_key }
            | ControlCommand::Pause { idempotency_key }
            | ControlCommand::SetCamera { idempotency_key, .. } => *idempotency_key,
        }
    }
}
