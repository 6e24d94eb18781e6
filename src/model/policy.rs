//! Per-tier `Policy` configuration and per-organization `QuotaLedger`
//! sliding windows.

use crate::errors::QuotaSubReason;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-tier configuration. Every recognized option is a plain
/// field rather than a free-form map, so admission checks are exhaustive
/// matches instead of string lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub max_concurrent_sessions: u32,
    pub max_concurrent_gpu: u32,
    pub allowed_gpu_classes: Vec<String>,
    pub hard_cpu_minute_cap: f64,
    pub hard_gpu_minute_cap: f64,
    pub idle_hibernate_seconds: u64,
    pub max_session_wall_seconds: u64,
    pub spot_eligible: bool,
    /// Whether `Idle(H)` continues to accrue minutes. Left as an explicit
    /// policy field; 0.0 means no accrual while hibernating (the default
    /// used by `free` tier below).
    pub idle_accrual_rate: f64,
}

impl Policy {
    pub fn free_tier() -> Self {
        Policy {
            max_concurrent_sessions: 1,
            max_concurrent_gpu: 0,
            allowed_gpu_classes: vec![],
            hard_cpu_minute_cap: 500.0,
            hard_gpu_minute_cap: 0.0,
            idle_hibernate_seconds: 300,
            max_session_wall_seconds: 3600 * 4,
            spot_eligible: true,
            idle_accrual_rate: 0.0,
        }
    }

    pub fn pro_tier() -> Self {
        Policy {
            max_concurrent_sessions: 10,
            max_concurrent_gpu: 2,
            allowed_gpu_classes: vec!["t4".to_string(), "a10g".to_string()],
            hard_cpu_minute_cap: 20_000.0,
            hard_gpu_minute_cap: 5_000.0,
            idle_hibernate_seconds: 1800,
            max_session_wall_seconds: 3600 * 24,
            spot_eligible: false,
            idle_accrual_rate: 0.0,
        }
    }
}

/// Per-organization counters. Mutated only by the Orchestrator
/// under a per-organization lock (the `QuotaLedgerTable` below), using a
/// compare-and-update loop so a cap crossing is detected atomically with
/// the increment, mirroring `SlidingWindow::check_and_increment`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuotaCounters {
    pub active_sessions: u32,
    pub active_gpu_sessions: u32,
    pub cpu_minutes_used: f64,
    pub gpu_minutes_used: f64,
}

/// Outcome of a ledger admission check, carrying the specific
/// `QuotaSubReason` a denial should surface.
pub enum QuotaCheck {
    Admit,
    Deny(QuotaSubReason),
}

impl QuotaCounters {
    /// Checks whether admitting one more session (optionally GPU) would
    /// stay within `policy`, without mutating the counters.
    pub fn check_admission(&self, policy: &Policy, wants_gpu: bool) -> QuotaCheck {
        if self.active_sessions >= policy.max_concurrent_sessions {
            return QuotaCheck::Deny(QuotaSubReason::Concurrent);
        }
        if wants_gpu && self.active_gpu_sessions >= policy.max_concurrent_gpu {
            return QuotaCheck::Deny(QuotaSubReason::GpuConcurrent);
        }
        if self.cpu_minutes_used >= policy.hard_cpu_minute_cap {
            return QuotaCheck::Deny(QuotaSubReason::CpuMinuteCap);
        }
        if wants_gpu && self.gpu_minutes_used >= policy.hard_gpu_minute_cap {
            return QuotaCheck::Deny(QuotaSubReason::GpuMinuteCap);
        }
        QuotaCheck::Admit
    }

    pub fn on_admit(&mut self, wants_gpu: bool) {
        self.active_sessions += 1;
        if wants_gpu {
            self.active_gpu_sessions += 1;
        }
    }

    pub fn on_terminal(&mut self, wants_gpu: bool) {
        self.active_sessions = self.active_sessions.saturating_sub(1);
        if wants_gpu {
            self.active_gpu_sessions = self.active_gpu_sessions.saturating_sub(1);
        }
    }

    /// Accrues wall-clock usage and reports whether a hard cap was just
    /// crossed, so the caller can transition the session to `Terminated`
    /// with reason `cap_hit`.
    pub fn accrue(&mut self, policy: &Policy, cpu_minutes: f64, gpu_minutes: f64) -> bool {
        self.cpu_minutes_used += cpu_minutes;
        self.gpu_minutes_used += gpu_minutes;
        self.cpu_minutes_used >= policy.hard_cpu_minute_cap
            || (gpu_minutes > 0.0 && self.gpu_minutes_used >= policy.hard_gpu_minute_cap)
    }
}

/// Per-organization quota ledgers. Each org gets its own entry so the
/// Orchestrator's per-org lock never contends across organizations.
#[derive(Debug, Default)]
pub struct QuotaLedgerTable {
    ledgers: HashMap<String, QuotaCounters>,
}

impl QuotaLedgerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, org_key: &str) -> &mut QuotaCounters {
        self.ledgers.entry(org_key.to_string()).or_default()
    }

    pub fn get(&self, org_key: &str) -> QuotaCounters {
        self.ledgers.get(org_key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_cap_denies_second_session() {
        let policy = Policy::free_tier();
        let mut counters = QuotaCounters::default();
        counters.on_admit(false);
        match counters.check_admission(&policy, false) {
            QuotaCheck::Deny(QuotaSubReason::Concurrent) => {}
            _ => panic!("expected concurrent denial"),
        }
    }

    #[test]
    fn gpu_class_not_allowed_is_an_admission_concern_not_a_ledger_one() {
        // The ledger only tracks counts; allowed_gpu_classes is checked by
        // the admission algorithm before the ledger is even consulted.
        let policy = Policy::free_tier();
        assert!(policy.allowed_gpu_classes.is_empty());
    }

    #[test]
    fn cap_hit_reported_on_accrue() {
        let policy = Policy::free_tier();
        let mut counters = QuotaCounters::default();
        let hit = counters.accrue(&policy, policy.hard_cpu_minute_cap, 0.0);
        assert!(hit);
    }
}
