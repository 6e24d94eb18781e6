//! Session entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub Uuid);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub Uuid);

/// Engine kinds the Simulation Engine Adapter supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Mujoco,
    Pybullet,
}

/// Requested compute resources for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub gpu_class: Option<String>,
}

impl Resources {
    pub fn wants_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// The session state machine:
/// `Pending -> Scheduling -> Pulling -> Booting -> Ready <-> Idle(H) -> Terminated`,
/// with any step able to transition to `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Scheduling,
    Pulling,
    Booting,
    Ready,
    Idle,
    Failed,
    Terminated,
}

impl SessionState {
    /// Whether `to` is a legal transition from `self`.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (*self, to) {
            (_, Failed) => true,
            (Pending, Scheduling) => true,
            (Scheduling, Pulling) => true,
            (Pulling, Booting) => true,
            (Booting, Ready) => true,
            (Ready, Idle) => true,
            (Idle, Ready) => true,
            (_, Terminated) => *self != Terminated,
            (Failed, Scheduling) => true, // bounded restart, generation + 1
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Scheduling => "scheduling",
            SessionState::Pulling => "pulling",
            SessionState::Booting => "booting",
            SessionState::Ready => "ready",
            SessionState::Idle => "idle",
            SessionState::Failed => "failed",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Primary unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub org_id: OrgId,
    pub resources: Resources,
    pub engine: EngineKind,
    pub model_ref: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub idle_timeout_secs: u64,
    pub generation: u64,
    pub hibernated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        workspace_id: WorkspaceId,
        org_id: OrgId,
        resources: Resources,
        engine: EngineKind,
        model_ref: String,
        idle_timeout_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Session {
            id: SessionId::new(),
            workspace_id,
            org_id,
            resources,
            engine,
            model_ref,
            state: SessionState::Pending,
            created_at: now,
            last_activity_at: now,
            terminated_at: None,
            idle_timeout_secs,
            generation: 0,
            hibernated_at: None,
        }
    }

    /// Applies a transition, recording a new generation on restart
    /// (`Failed -> Scheduling`) but never on `Reset` — resetting the
    /// engine instance is handled entirely within the Simulation Agent
    /// and never touches `generation`.
    pub fn transition(&mut self, to: SessionState, now: DateTime<Utc>) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        if self.state == SessionState::Failed && to == SessionState::Scheduling {
            self.generation += 1;
        }
        self.state = to;
        if to == SessionState::Idle {
            self.hibernated_at = Some(now);
        } else {
            self.hibernated_at = None;
        }
        if to == SessionState::Terminated {
            self.terminated_at = Some(now);
        }
        true
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> Session {
        Session::new(
            WorkspaceId(Uuid::new_v4()),
            OrgId(Uuid::new_v4()),
            Resources {
                cpu_cores: 2.0,
                memory_bytes: 4 << 30,
                gpu_count: 0,
                gpu_class: None,
            },
            EngineKind::Mujoco,
            "cartpole".to_string(),
            60,
            now,
        )
    }

    #[test]
    fn happy_path_sequence() {
        let now = Utc::now();
        let mut s = sample(now);
        assert!(s.transition(SessionState::Scheduling, now));
        assert!(s.transition(SessionState::Pulling, now));
        assert!(s.transition(SessionState::Booting, now));
        assert!(s.transition(SessionState::Ready, now));
        assert_eq!(s.state, SessionState::Ready);
        assert_eq!(s.generation, 0);
    }

    #[test]
    fn idle_round_trip_does_not_change_generation() {
        let now = Utc::now();
        let mut s = sample(now);
        s.state = SessionState::Ready;
        assert!(s.transition(SessionState::Idle, now));
        assert!(s.transition(SessionState::Ready, now));
        assert_eq!(s.generation, 0);
    }

    #[test]
    fn restart_bumps_generation() {
        let now = Utc::now();
        let mut s = sample(now);
        s.state = SessionState::Failed;
        assert!(s.transition(SessionState::Scheduling, now));
        assert_eq!(s.generation, 1);
    }

    #[test]
    fn invalid_transition_rejected() {
        let now = Utc::now();
        let mut s = sample(now);
        // Pending cannot jump straight to Ready.
        assert!(!s.transition(SessionState::Ready, now));
        assert_eq!(s.state, SessionState::Pending);
    }

    #[test]
    fn terminated_is_terminal() {
        let now = Utc::now();
        let mut s = sample(now);
        assert!(s.transition(SessionState::Terminated, now));
        assert!(s.is_terminal());
        assert!(!s.transition(SessionState::Scheduling, now));
    }
}
