//! Session Orchestrator: admission, the session state
//! machine, pod supervision, idle detection, quota accounting, and the
//! cost guard.

pub mod api;
mod scheduler;

pub use scheduler::{select_pool, NodePool};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::errors::{AdmissionError, CosimError, QuotaSubReason, SchedulingError, SessionError};
use crate::events::{Event, EventBus, EventKind};
use crate::model::{EngineKind, OrgId, PodHandle, Policy, QuotaCheck, QuotaLedgerTable, Resources, Session, SessionId, SessionState, WorkspaceId};

/// Health report an Agent pod sends the Orchestrator.
#[derive(Clone, Debug)]
pub struct HealthProbe {
    pub healthy: bool,
    pub frame_counter: u64,
    pub playing: bool,
}

/// Cost-guard actions issued on a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CostGuardAction {
    ScaleDown { org_key: String },
    PauseSession { session_id: SessionId },
    DenyNewGpuJob { org_key: String },
}

struct SessionRecord {
    session: Session,
    org_key: String,
    tier: String,
    last_frame_counter: u64,
    stale_frame_ticks: u32,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventBus>,
    sessions: DashMap<SessionId, Mutex<SessionRecord>>,
    pods: DashMap<SessionId, Mutex<PodHandle>>,
    quotas: Mutex<QuotaLedgerTable>,
    policies: HashMap<String, Policy>,
    node_pools: Mutex<Vec<NodePool>>,
    restart_log: DashMap<SessionId, Mutex<VecDeque<DateTime<Utc>>>>,
    gpu_denied_orgs: DashMap<String, ()>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, clock: Arc<dyn Clock>, events: Arc<dyn EventBus>, node_pools: Vec<NodePool>) -> Self {
        let mut policies = HashMap::new();
        policies.insert("free".to_string(), Policy::free_tier());
        policies.insert("pro".to_string(), Policy::pro_tier());
        Orchestrator {
            config,
            clock,
            events,
            sessions: DashMap::new(),
            pods: DashMap::new(),
            quotas: Mutex::new(QuotaLedgerTable::new()),
            policies,
            node_pools: Mutex::new(node_pools),
            restart_log: DashMap::new(),
            gpu_denied_orgs: DashMap::new(),
        }
    }

    fn policy_for(&self, tier: &str) -> Policy {
        self.policies.get(tier).cloned().unwrap_or_else(Policy::free_tier)
    }

    /// Runs the admission algorithm and, on
    /// success, schedules the session through to `Ready`.
    pub async fn create_session(
        &self,
        workspace_id: WorkspaceId,
        org_id: OrgId,
        org_key: String,
        tier: String,
        resources: Resources,
        engine: EngineKind,
        model_ref: String,
        idle_timeout_secs: u64,
    ) -> Result<SessionId, CosimError> {
        let policy = self.policy_for(&tier);

        if policy.max_session_wall_seconds == 0 {
            return Err(AdmissionError::PolicyDenied { reason: "wall-time cap is zero; session would expire immediately".into() }.into());
        }

        if resources.wants_gpu() {
            let class = resources.gpu_class.as_deref().unwrap_or("");
            if !policy.allowed_gpu_classes.iter().any(|c| c == class) {
                return Err(AdmissionError::PolicyDenied { reason: format!("gpu class '{class}' not allowed for tier '{tier}'") }.into());
            }
            if self.gpu_denied_orgs.contains_key(&org_key) {
                return Err(AdmissionError::PolicyDenied { reason: "gpu jobs currently denied by cost guard".into() }.into());
            }
        }

        {
            let mut ledger = self.quotas.lock();
            let counters = ledger.entry(&org_key);
            match counters.check_admission(&policy, resources.wants_gpu()) {
                QuotaCheck::Admit => counters.on_admit(resources.wants_gpu()),
                QuotaCheck::Deny(sub_reason) => return Err(AdmissionError::QuotaExceeded { sub_reason }.into()),
            }
        }

        let now = self.clock.now();
        let session = Session::new(workspace_id, org_id, resources.clone(), engine, model_ref.clone(), idle_timeout_secs, now);
        let session_id = session.id;
        self.sessions.insert(
            session_id,
            Mutex::new(SessionRecord { session, org_key: org_key.clone(), tier, last_frame_counter: 0, stale_frame_ticks: 0 }),
        );
        self.publish(session_id, EventKind::Created, org_id, 0, None).await;

        self.schedule(session_id, org_id, policy, resources).await;
        Ok(session_id)
    }

    async fn schedule(&self, session_id: SessionId, org_id: OrgId, policy: Policy, resources: Resources) {
        let generation = {
            let entry = self.sessions.get(&session_id).unwrap();
            let mut record = entry.lock();
            record.session.transition(SessionState::Scheduling, self.clock.now());
            record.session.generation
        };

        let pool = {
            let pools = self.node_pools.lock();
            select_pool(&pools, &resources, policy.spot_eligible).cloned()
        };

        let Some(pool) = pool else {
            self.fault(session_id, org_id, "no node pool available").await;
            return;
        };

        match scheduler::allocate_with_backoff(&self.config, session_id, generation, &pool, || format!("10.0.{}.1:9000", generation % 255)).await
        {
            Ok(pod) => {
                self.pods.insert(session_id, Mutex::new(pod));
                let entry = self.sessions.get(&session_id).unwrap();
                let mut record = entry.lock();
                let now = self.clock.now();
                record.session.transition(SessionState::Pulling, now);
                record.session.transition(SessionState::Booting, now);
                record.session.transition(SessionState::Ready, now);
                drop(record);
                self.publish(session_id, EventKind::Ready, org_id, generation, None).await;
            }
            Err(err) => {
                warn!(%session_id, %err, "scheduling exhausted retries");
                self.fault(session_id, org_id, "scheduling failed").await;
            }
        }
    }

    /// Transitions a session to `Failed` and, if the restart budget
    /// allows, restarts it (generation + 1); otherwise `Terminated`.
    async fn fault(&self, session_id: SessionId, org_id: OrgId, reason: &str) {
        let (resources, policy) = {
            let entry = self.sessions.get(&session_id).unwrap();
            let record = entry.lock();
            let policy = self.policy_for(&record.tier);
            let now = self.clock.now();
            drop(record);
            let mut record = entry.lock();
            record.session.transition(SessionState::Failed, now);
            (record.session.resources.clone(), policy)
        };
        self.publish(session_id, EventKind::Failed, org_id, self.generation_of(session_id), Some(reason.to_string())).await;

        if self.restart_budget_ok(session_id) {
            let generation = {
                let entry = self.sessions.get(&session_id).unwrap();
                let mut record = entry.lock();
                let now = self.clock.now();
                record.session.transition(SessionState::Scheduling, now);
                record.session.generation
            };
            info!(%session_id, generation, "restarting session within restart budget");
            self.schedule(session_id, org_id, policy, resources).await;
        } else {
            self.terminate(session_id, org_id, "restart_budget_exceeded").await;
        }
    }

    fn generation_of(&self, session_id: SessionId) -> u64 {
        self.sessions.get(&session_id).map(|r| r.lock().session.generation).unwrap_or(0)
    }

    fn restart_budget_ok(&self, session_id: SessionId) -> bool {
        let log = self.restart_log.entry(session_id).or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut entries = log.lock();
        let now = self.clock.now();
        let window = chrono::Duration::from_std(self.config.restart_budget_window).unwrap_or(chrono::Duration::hours(1));
        while entries.front().is_some_and(|t| now - *t > window) {
            entries.pop_front();
        }
        if entries.len() as u32 >= self.config.restart_budget {
            return false;
        }
        entries.push_back(now);
        true
    }

    pub async fn delete_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let (org_id, wants_gpu, org_key) = {
            let record = self.sessions.get(&session_id).ok_or(SessionError::SessionNotFound)?;
            let guard = record.lock();
            (guard.session.org_id, guard.session.resources.wants_gpu(), guard.org_key.clone())
        };
        self.terminate(session_id, org_id, "explicit_delete").await;
        self.quotas.lock().entry(&org_key).on_terminal(wants_gpu);
        Ok(())
    }

    async fn terminate(&self, session_id: SessionId, org_id: OrgId, reason: &str) {
        let generation = {
            let mut record = match self.sessions.get(&session_id) {
                Some(r) => r,
                None => return,
            };
            let mut guard = record.lock();
            let now = self.clock.now();
            guard.session.transition(SessionState::Terminated, now);
            guard.session.generation
        };
        if let Some(pod) = self.pods.get(&session_id) {
            pod.lock().mark_gone();
        }
        self.publish(session_id, EventKind::Terminated, org_id, generation, Some(reason.to_string())).await;
    }

    /// Health probe intake: two consecutive
    /// failures, or a frozen frame counter while `Play` for more than
    /// three intervals, trips a fault.
    pub async fn health_check(&self, session_id: SessionId, probe: HealthProbe) {
        let org_id = match self.sessions.get(&session_id) {
            Some(r) => r.lock().session.org_id,
            None => return,
        };

        let mut tripped = false;
        if let Some(pod) = self.pods.get(&session_id) {
            tripped |= pod.lock().record_probe(probe.healthy);
        }

        {
            let entry = self.sessions.get(&session_id).unwrap();
            let mut record = entry.lock();
            if probe.playing && probe.frame_counter == record.last_frame_counter {
                record.stale_frame_ticks += 1;
                if record.stale_frame_ticks > 3 {
                    tripped = true;
                }
            } else {
                record.stale_frame_ticks = 0;
            }
            record.last_frame_counter = probe.frame_counter;
        }

        if tripped {
            self.fault(session_id, org_id, "health probe failure").await;
        }
    }

    /// Resets the idle timer on any control/edit/viewer activity and
    /// resumes a hibernating session.
    pub async fn record_activity(&self, session_id: SessionId) {
        let (org_id, generation, was_idle) = {
            let mut record = match self.sessions.get(&session_id) {
                Some(r) => r,
                None => return,
            };
            let mut guard = record.lock();
            let now = self.clock.now();
            guard.session.touch(now);
            let was_idle = guard.session.state == SessionState::Idle;
            if was_idle {
                guard.session.transition(SessionState::Ready, now);
            }
            (guard.session.org_id, guard.session.generation, was_idle)
        };
        if was_idle {
            self.publish(session_id, EventKind::Resumed, org_id, generation, None).await;
        }
    }

    /// Explicit `PATCH /sessions/{id} {action: pause}`: moves a
    /// `Ready` session to `Idle` immediately rather than waiting out
    /// `policy.idle_hibernate_seconds`.
    pub async fn request_hibernate(&self, session_id: SessionId) {
        let (org_id, generation, was_ready) = {
            let entry = match self.sessions.get(&session_id) {
                Some(r) => r,
                None => return,
            };
            let mut record = entry.lock();
            let now = self.clock.now();
            let was_ready = record.session.state == SessionState::Ready;
            if was_ready {
                record.session.transition(SessionState::Idle, now);
            }
            (record.session.org_id, record.session.generation, was_ready)
        };
        if was_ready {
            self.publish(session_id, EventKind::Idle, org_id, generation, Some("explicit_pause".to_string())).await;
        }
    }

    /// Idle + quota + cost-guard sweep, run on `ORCH_SCHEDULE_INTERVAL_MS`
    /// by a binary's background tick.
    pub async fn tick(&self, elapsed: std::time::Duration) {
        self.idle_sweep().await;
        self.wall_clock_sweep().await;
        self.quota_sweep(elapsed).await;
        self.cost_guard_sweep().await;
    }

    async fn idle_sweep(&self) {
        let now = self.clock.now();
        let candidates: Vec<(SessionId, OrgId, u64, String)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock();
                if guard.session.state != SessionState::Ready {
                    return None;
                }
                let policy = self.policy_for(&guard.tier);
                let idle_for = (now - guard.session.last_activity_at).num_seconds().max(0) as u64;
                if idle_for >= policy.idle_hibernate_seconds {
                    Some((guard.session.id, guard.session.org_id, guard.session.generation, guard.tier.clone()))
                } else {
                    None
                }
            })
            .collect();

        for (session_id, org_id, generation, _tier) in candidates {
            if let Some(record) = self.sessions.get(&session_id) {
                record.lock().session.transition(SessionState::Idle, now);
            }
            self.publish(session_id, EventKind::Idle, org_id, generation, None).await;
        }
    }

    /// Terminates sessions whose wall-clock age has crossed
    /// `policy.max_session_wall_seconds`, and `Idle` sessions that have
    /// been hibernating longer than `config.hibernate_to_terminate`.
    async fn wall_clock_sweep(&self) {
        let now = self.clock.now();
        let hibernate_to_terminate = chrono::Duration::from_std(self.config.hibernate_to_terminate).unwrap_or(chrono::Duration::hours(1));

        let to_terminate: Vec<(SessionId, OrgId, &'static str)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock();
                if guard.session.is_terminal() {
                    return None;
                }
                let policy = self.policy_for(&guard.tier);
                let age = now - guard.session.created_at;
                if age.num_seconds().max(0) as u64 >= policy.max_session_wall_seconds {
                    return Some((guard.session.id, guard.session.org_id, "wall_time_cap_hit"));
                }
                if guard.session.state == SessionState::Idle {
                    if let Some(hibernated_at) = guard.session.hibernated_at {
                        if now - hibernated_at >= hibernate_to_terminate {
                            return Some((guard.session.id, guard.session.org_id, "hibernate_to_terminate"));
                        }
                    }
                }
                None
            })
            .collect();

        for (session_id, org_id, reason) in to_terminate {
            self.terminate(session_id, org_id, reason).await;
        }
    }

    async fn quota_sweep(&self, elapsed: std::time::Duration) {
        let minutes = elapsed.as_secs_f64() / 60.0;
        let to_terminate: Vec<(SessionId, OrgId)> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().lock();
                let policy = self.policy_for(&guard.tier);
                let (cpu_rate, gpu_rate) = match guard.session.state {
                    SessionState::Ready => (1.0, 1.0),
                    SessionState::Idle => (policy.idle_accrual_rate, policy.idle_accrual_rate),
                    _ => return None,
                };
                let wants_gpu = guard.session.resources.wants_gpu();
                let cpu_minutes = minutes * guard.session.resources.cpu_cores * cpu_rate;
                let gpu_minutes = if wants_gpu { minutes * guard.session.resources.gpu_count as f64 * gpu_rate } else { 0.0 };
                let cap_hit = self.quotas.lock().entry(&guard.org_key).accrue(&policy, cpu_minutes, gpu_minutes);
                if cap_hit {
                    Some((guard.session.id, guard.session.org_id))
                } else {
                    None
                }
            })
            .collect();

        for (session_id, org_id) in to_terminate {
            self.terminate(session_id, org_id, "cap_hit").await;
        }
    }

    /// Cost-guard thresholds: 80% of a hard cap scales down, 95% pauses
    /// the session outright, and GPU usage past 80% denies further GPU
    /// admission for the organization until usage drops.
    async fn cost_guard_sweep(&self) -> Vec<CostGuardAction> {
        const SCALE_DOWN_RATIO: f64 = 0.8;
        const PAUSE_RATIO: f64 = 0.95;
        const GPU_DENY_RATIO: f64 = 0.8;

        let mut actions = Vec::new();
        let org_keys: Vec<String> = self.sessions.iter().map(|e| e.value().lock().org_key.clone()).collect();
        let mut seen = std::collections::HashSet::new();

        for org_key in org_keys {
            if !seen.insert(org_key.clone()) {
                continue;
            }
            let tier = self
                .sessions
                .iter()
                .find(|e| e.value().lock().org_key == org_key)
                .map(|e| e.value().lock().tier.clone())
                .unwrap_or_else(|| "free".to_string());
            let policy = self.policy_for(&tier);
            let counters = self.quotas.lock().get(&org_key);

            if counters.cpu_minutes_used >= policy.hard_cpu_minute_cap * PAUSE_RATIO {
                for entry in self.sessions.iter() {
                    let (session_id, org_id, matches, is_ready) = {
                        let guard = entry.value().lock();
                        (guard.session.id, guard.session.org_id, guard.org_key == org_key, guard.session.state == SessionState::Ready)
                    };
                    if matches && is_ready {
                        entry.value().lock().session.transition(SessionState::Idle, self.clock.now());
                        self.publish(session_id, EventKind::Idle, org_id, self.generation_of(session_id), Some("cost_guard_pause".into())).await;
                        actions.push(CostGuardAction::PauseSession { session_id });
                    }
                }
            } else if counters.cpu_minutes_used >= policy.hard_cpu_minute_cap * SCALE_DOWN_RATIO {
                actions.push(CostGuardAction::ScaleDown { org_key: org_key.clone() });
            }

            if policy.hard_gpu_minute_cap > 0.0 && counters.gpu_minutes_used >= policy.hard_gpu_minute_cap * GPU_DENY_RATIO {
                self.gpu_denied_orgs.insert(org_key.clone(), ());
                actions.push(CostGuardAction::DenyNewGpuJob { org_key });
            }
        }
        actions
    }

    async fn publish(&self, session_id: SessionId, kind: EventKind, org_id: OrgId, generation: u64, reason: Option<String>) {
        self.events.publish(Event { kind, session_id, generation, org_id, reason, ts: self.clock.now() }).await;
    }

    pub fn state_of(&self, session_id: SessionId) -> Result<SessionState, SessionError> {
        self.sessions.get(&session_id).map(|r| r.lock().session.state).ok_or(SessionError::SessionNotFound)
    }

    pub fn session_snapshot(&self, session_id: SessionId) -> Result<Session, SessionError> {
        self.sessions.get(&session_id).map(|r| r.lock().session.clone()).ok_or(SessionError::SessionNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::events::LoggingEventBus;
    use chrono::Utc;

    fn orchestrator(pools: Vec<NodePool>) -> (Orchestrator, Arc<VirtualClock>) {
        let clock = VirtualClock::new(Utc::now());
        let orch = Orchestrator::new(OrchestratorConfig::default(), clock.clone(), Arc::new(LoggingEventBus), pools);
        (orch, clock)
    }

    fn cpu_pool() -> NodePool {
        NodePool { name: "cpu-a".into(), has_gpu: false, gpu_class: None, spot_eligible: true, capacity: 10, load: 0 }
    }

    fn resources() -> Resources {
        Resources { cpu_cores: 2.0, memory_bytes: 4 << 30, gpu_count: 0, gpu_class: None }
    }

    #[tokio::test]
    async fn admitted_session_reaches_ready() {
        let (orch, _clock) = orchestrator(vec![cpu_pool()]);
        let session_id = orch
            .create_session(WorkspaceId(uuid::Uuid::new_v4()), OrgId(uuid::Uuid::new_v4()), "org-a".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60)
            .await
            .unwrap();
        assert_eq!(orch.state_of(session_id).unwrap(), SessionState::Ready);
    }

    #[tokio::test]
    async fn second_session_over_concurrency_cap_is_denied() {
        let (orch, _clock) = orchestrator(vec![cpu_pool()]);
        let org_id = OrgId(uuid::Uuid::new_v4());
        let workspace = WorkspaceId(uuid::Uuid::new_v4());
        orch.create_session(workspace, org_id, "org-a".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60).await.unwrap();
        let result = orch.create_session(workspace, org_id, "org-a".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60).await;
        assert!(matches!(result, Err(CosimError::Admission(AdmissionError::QuotaExceeded { sub_reason: QuotaSubReason::Concurrent }))));
    }

    #[tokio::test]
    async fn idle_sweep_hibernates_after_timeout_then_activity_resumes() {
        let (orch, clock) = orchestrator(vec![cpu_pool()]);
        let session_id = orch
            .create_session(WorkspaceId(uuid::Uuid::new_v4()), OrgId(uuid::Uuid::new_v4()), "org-b".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(301));
        orch.tick(std::time::Duration::from_secs(301)).await;
        assert_eq!(orch.state_of(session_id).unwrap(), SessionState::Idle);

        orch.record_activity(session_id).await;
        assert_eq!(orch.state_of(session_id).unwrap(), SessionState::Ready);
    }

    #[tokio::test]
    async fn two_consecutive_health_failures_fault_and_restart_within_budget() {
        let (orch, _clock) = orchestrator(vec![cpu_pool()]);
        let session_id = orch
            .create_session(WorkspaceId(uuid::Uuid::new_v4()), OrgId(uuid::Uuid::new_v4()), "org-c".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60)
            .await
            .unwrap();
        orch.health_check(session_id, HealthProbe { healthy: false, frame_counter: 0, playing: false }).await;
        orch.health_check(session_id, HealthProbe { healthy: false, frame_counter: 0, playing: false }).await;
        assert_eq!(orch.state_of(session_id).unwrap(), SessionState::Ready);
        assert_eq!(orch.session_snapshot(session_id).unwrap().generation, 1);
    }

    #[tokio::test]
    async fn explicit_delete_terminates_and_frees_quota() {
        let (orch, _clock) = orchestrator(vec![cpu_pool()]);
        let session_id = orch
            .create_session(WorkspaceId(uuid::Uuid::new_v4()), OrgId(uuid::Uuid::new_v4()), "org-d".into(), "free".into(), resources(), EngineKind::Mujoco, "cartpole".into(), 60)
            .await
            .unwrap();
        orch.delete_session(session_id).await.unwrap();
        assert_eq!(orch.state_of(session_id).unwrap(), SessionState::Terminated);
    }
}
