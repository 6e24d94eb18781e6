//! User-Code Sandbox: executes a user-supplied source
//! string with a bound `sim` reference and a small standard toolkit,
//! under a wall-clock timeout and memory cap, with truncated stdout/
//! stderr rather than aborted capture.

mod guard;
mod interpreter;

pub use interpreter::SimOp;

use crate::engine::EngineAdapter;
use crate::errors::SandboxError;
use std::time::{Duration, Instant};

/// Caller-supplied bounds for an `execute(source, lang, timeout, limits)` call.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub timeout: Duration,
    pub memory_bytes: u64,
    pub stdout_cap_bytes: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug)]
pub struct ExecuteResult {
    pub status: Status,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error_kind: Option<SandboxError>,
    pub final_state: Option<crate::engine::State>,
}

const TRUNCATION_MARKER: &[u8] = "…truncated".as_bytes();

fn truncate(mut buf: Vec<u8>, cap: usize) -> Vec<u8> {
    if buf.len() > cap {
        buf.truncate(cap);
        buf.extend_from_slice(TRUNCATION_MARKER);
    }
    buf
}

/// Applies ops to `sim` one at a time, stopping at the first failure.
/// Returns the error kind (if any) and the state after the last
/// successfully applied op, so the caller always sees a well-defined state
/// even after a mid-sequence failure.
fn apply_ops(ops: &[SimOp], sim: &mut dyn EngineAdapter) -> (Option<SandboxError>, crate::engine::State) {
    let mut last_state = sim.state();
    for op in ops {
        let result = match op {
            SimOp::Reset => Ok(sim.reset()),
            SimOp::Step(actions) => sim.step(actions),
            SimOp::SetCamera { distance, yaw, pitch, target } => sim
                .set_camera(crate::engine::CameraParams { distance: *distance, yaw: *yaw, pitch: *pitch, target: *target })
                .map(|_| sim.state()),
        };
        match result {
            Ok(state) => last_state = state,
            Err(_) => return (Some(SandboxError::RuntimeFault), last_state),
        }
    }
    (None, last_state)
}

/// Executes `source` against `sim`. `grace` is the watchdog's grace
/// window beyond `limits.timeout` (default 250ms, see `SANDBOX_GRACE_MS`).
pub async fn execute(
    source: &str,
    language: &str,
    limits: Limits,
    grace: Duration,
    sim: &mut dyn EngineAdapter,
) -> ExecuteResult {
    if language != "python" {
        return ExecuteResult {
            status: Status::Error,
            stdout: Vec::new(),
            stderr: Vec::new(),
            error_kind: Some(SandboxError::UnsupportedLanguage),
            final_state: None,
        };
    }

    if let Some(violation) = guard::first_violation(source) {
        return ExecuteResult {
            status: Status::Error,
            stdout: Vec::new(),
            stderr: violation.into_bytes(),
            error_kind: Some(SandboxError::RuntimeFault),
            final_state: Some(sim.state()),
        };
    }

    let source = source.to_string();
    let deadline = Instant::now() + limits.timeout;
    let memory_bytes = limits.memory_bytes;
    let worker_grace = grace;
    let join_result = tokio::time::timeout(
        limits.timeout + grace + Duration::from_millis(50),
        tokio::task::spawn_blocking(move || interpreter::interpret(&source, deadline, worker_grace, memory_bytes)),
    )
    .await;

    let outcome = match join_result {
        Ok(Ok(outcome)) => outcome,
        // The watchdog's own bound tripped before the worker returned, or
        // the worker task panicked — both surface as Timeout since no
        // partial effects beyond what the worker already reported apply.
        _ => interpreter::InterpretOutcome { stdout: Vec::new(), ops: Vec::new(), error_kind: Some(SandboxError::Timeout) },
    };

    let (engine_error, final_state) = apply_ops(&outcome.ops, sim);
    let error_kind = outcome.error_kind.or(engine_error);

    ExecuteResult {
        status: if error_kind.is_none() { Status::Ok } else { Status::Error },
        stdout: truncate(outcome.stdout, limits.stdout_cap_bytes),
        stderr: Vec::new(),
        error_kind,
        final_state: Some(final_state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{self, Dims};
    use crate::model::EngineKind;

    fn test_limits() -> Limits {
        Limits { timeout: Duration::from_millis(500), memory_bytes: u64::MAX, stdout_cap_bytes: 64 * 1024 }
    }

    #[tokio::test]
    async fn reset_then_get_state_reports_zeroed_counters() {
        let mut sim = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let result = execute("sim.reset()\n", "python", test_limits(), Duration::from_millis(250), sim.as_mut()).await;
        assert_eq!(result.status, Status::Ok);
        let state = result.final_state.unwrap();
        assert_eq!(state.frame_counter, 0);
        assert_eq!(state.physics_time, 0.0);
    }

    #[tokio::test]
    async fn timeout_is_reported_within_timeout_plus_grace() {
        let mut sim = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let limits = Limits { timeout: Duration::from_millis(100), memory_bytes: u64::MAX, stdout_cap_bytes: 1024 };
        let start = Instant::now();
        let result = execute("while True: pass\n", "python", limits, Duration::from_millis(50), sim.as_mut()).await;
        assert_eq!(result.status, Status::Error);
        assert!(matches!(result.error_kind, Some(SandboxError::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(100 + 50 + 200));
        // Engine defined afterwards: a subsequent state read still succeeds.
        let _ = sim.state();
    }

    #[tokio::test]
    async fn unsupported_language_fails_fast_not_as_a_timeout() {
        let mut sim = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let result = execute("puts 1", "ruby", test_limits(), Duration::from_millis(250), sim.as_mut()).await;
        assert!(matches!(result.error_kind, Some(SandboxError::UnsupportedLanguage)));
    }

    #[tokio::test]
    async fn stdout_is_truncated_with_marker_not_aborted() {
        let mut sim = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let source = (0..200).map(|_| "print(\"x\")\n").collect::<String>();
        let limits = Limits { timeout: Duration::from_millis(500), memory_bytes: u64::MAX, stdout_cap_bytes: 8 };
        let result = execute(&source, "python", limits, Duration::from_millis(250), sim.as_mut()).await;
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.stdout.len(), 8 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn banned_import_fails_without_partial_effects() {
        let mut sim = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let before = sim.state();
        let result = execute("import os\nsim.step([1.0])\n", "python", test_limits(), Duration::from_millis(250), sim.as_mut()).await;
        assert!(matches!(result.error_kind, Some(SandboxError::RuntimeFault)));
        assert_eq!(sim.state().frame_counter, before.frame_counter);
    }
}
