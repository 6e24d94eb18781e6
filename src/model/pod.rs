//! Pod handle entity.

use super::session::SessionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId(pub Uuid);

impl PodId {
    pub fn new() -> Self {
        PodId(Uuid::new_v4())
    }
}

impl Default for PodId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodHealth {
    Unknown,
    Healthy,
    Unhealthy,
    Gone,
}

/// Externally allocated execution unit bound to a session generation.
/// Exactly one pod handle is active per session generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodHandle {
    pub id: PodId,
    pub session_id: SessionId,
    pub generation: u64,
    pub node_pool: String,
    pub address: String,
    pub health: PodHealth,
    pub consecutive_health_failures: u32,
}

impl PodHandle {
    pub fn new(session_id: SessionId, generation: u64, node_pool: String, address: String) -> Self {
        PodHandle {
            id: PodId::new(),
            session_id,
            generation,
            node_pool,
            address,
            health: PodHealth::Unknown,
            consecutive_health_failures: 0,
        }
    }

    /// Records a health probe result; returns `true` if this crosses the
    /// two-consecutive-failures threshold that the Orchestrator treats as
    /// a fault.
    pub fn record_probe(&mut self, healthy: bool) -> bool {
        if healthy {
            self.health = PodHealth::Healthy;
            self.consecutive_health_failures = 0;
            false
        } else {
            self.health = PodHealth::Unhealthy;
            self.consecutive_health_failures += 1;
            self.consecutive_health_failures >= 2
        }
    }

    pub fn mark_gone(&mut self) {
        self.health = PodHealth::Gone;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_consecutive_failures_trip() {
        let mut pod = PodHandle::new(SessionId::new(), 0, "cpu-pool-a".into(), "10.0.0.1:9000".into());
        assert!(!pod.record_probe(false));
        assert!(pod.record_probe(false));
    }

    #[test]
    fn a_success_resets_the_streak() {
        let mut pod = PodHandle::new(SessionId::new(), 0, "cpu-pool-a".into(), "10.0.0.1:9000".into());
        assert!(!pod.record_probe(false));
        assert!(!pod.record_probe(true));
        assert!(!pod.record_probe(false));
    }
}
