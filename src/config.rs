//! Process-wide configuration, loaded once from the environment variables
//! recognized by the core and injected into components as a
//! nested-struct-with-`Default` config tree.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Orchestrator (C5) tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub schedule_interval: Duration,
    pub health_interval: Duration,
    pub restart_budget: u32,
    pub restart_budget_window: Duration,
    pub allocator_backoff_base: Duration,
    pub allocator_backoff_factor: f64,
    pub allocator_backoff_cap: Duration,
    pub allocator_max_attempts: u32,
    pub hibernate_to_terminate: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            schedule_interval: Duration::from_millis(env_u64("ORCH_SCHEDULE_INTERVAL_MS", 1000)),
            health_interval: Duration::from_millis(env_u64("ORCH_HEALTH_INTERVAL_MS", 10_000)),
            restart_budget: env_u64("ORCH_RESTART_BUDGET", 3) as u32,
            restart_budget_window: Duration::from_secs(3600),
            allocator_backoff_base: Duration::from_millis(500),
            allocator_backoff_factor: 2.0,
            allocator_backoff_cap: Duration::from_secs(15),
            allocator_max_attempts: 5,
            hibernate_to_terminate: Duration::from_secs(3600),
        }
    }
}

/// Media Signaling Plane (C4) tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub room_grace: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        SignalingConfig {
            room_grace: Duration::from_millis(env_u64("SIGNALING_ROOM_GRACE_MS", 30_000)),
        }
    }
}

/// Simulation Agent (C3) tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_subscribers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            max_subscribers: env_u64("AGENT_PRODUCER_MAX_SUBSCRIBERS", 64) as usize,
        }
    }
}

/// User-Code Sandbox (C2) tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub default_timeout: Duration,
    pub grace: Duration,
    pub stdout_cap_bytes: usize,
    pub memory_limit_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            default_timeout: Duration::from_millis(env_u64("SANDBOX_DEFAULT_TIMEOUT_MS", 5_000)),
            grace: Duration::from_millis(env_u64("SANDBOX_GRACE_MS", 250)),
            stdout_cap_bytes: env_u64("SANDBOX_STDOUT_CAP_BYTES", 64 * 1024) as usize,
            memory_limit_bytes: env_u64("SANDBOX_MEMORY_LIMIT_BYTES", 256 * 1024 * 1024),
        }
    }
}

/// Top-level configuration assembled at process start.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub signaling: SignalingConfig,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Config::default()
    }
}
