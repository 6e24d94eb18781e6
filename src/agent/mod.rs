//! Simulation Agent: one process per pod, owning every
//! session scheduled onto it, via a `DashMap<SessionId, SessionEntry>`
//! guarding one producer task each.

mod producer;
pub mod api;

pub use producer::{Command, ControlReply, PlayState, ProducerLoop};

use crate::config::{AgentConfig, SandboxConfig};
use crate::engine;
use crate::errors::SessionError;
use crate::external::ControlDocWatcher;
use crate::model::{ControlCommand, EngineKind, SessionId, StreamItem};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// The parameters a `CreateSimulation` call pins a session to. Repeat
/// calls with matching params are a no-op; mismatched params are rejected
/// with `AlreadyExistsDifferent`.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateParams {
    pub engine: EngineKind,
    pub model_ref: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub headless: bool,
}

struct SessionEntry {
    params: CreateParams,
    generation: u64,
    command_tx: mpsc::Sender<Command>,
    frame_tx: broadcast::Sender<StreamItem>,
    join: JoinHandle<()>,
}

pub struct SimulationAgent {
    sessions: DashMap<SessionId, SessionEntry>,
    #[allow(dead_code)]
    config: AgentConfig,
    sandbox: SandboxConfig,
    control_docs: Arc<dyn ControlDocWatcher>,
}

impl SimulationAgent {
    pub fn new(config: AgentConfig, sandbox: SandboxConfig, control_docs: Arc<dyn ControlDocWatcher>) -> Self {
        SimulationAgent { sessions: DashMap::new(), config, sandbox, control_docs }
    }

    pub fn create_simulation(
        &self,
        session_id: SessionId,
        generation: u64,
        params: CreateParams,
    ) -> Result<(), SessionError> {
        if let Some(existing) = self.sessions.get(&session_id) {
            return if existing.params == params && existing.generation == generation {
                Ok(())
            } else {
                Err(SessionError::AlreadyExistsDifferent)
            };
        }

        let dims = engine::Dims { width: params.width, height: params.height };
        let engine_instance = engine::load(params.engine, &params.model_ref, dims, params.fps, params.headless)?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (frame_tx, _) = broadcast::channel(256);
        let producer = ProducerLoop {
            session_id,
            generation,
            engine: engine_instance,
            fps: params.fps,
            sandbox_limits: crate::sandbox::Limits {
                timeout: self.sandbox.default_timeout,
                memory_bytes: self.sandbox.memory_limit_bytes,
                stdout_cap_bytes: self.sandbox.stdout_cap_bytes,
            },
            sandbox_grace: self.sandbox.grace,
            control_docs: self.control_docs.clone(),
            command_rx,
            frame_tx: frame_tx.clone(),
        };
        let join = tokio::spawn(producer.run());

        self.sessions.insert(session_id, SessionEntry { params, generation, command_tx, frame_tx, join });
        info!(%session_id, "simulation created");
        Ok(())
    }

    pub async fn control(&self, session_id: SessionId, command: ControlCommand) -> Result<ControlReply, SessionError> {
        let command_tx = {
            let entry = self.sessions.get(&session_id).ok_or(SessionError::SessionNotFound)?;
            entry.command_tx.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx
            .send(Command::Control { command, reply: reply_tx })
            .await
            .map_err(|_| SessionError::SessionTerminated)?;
        reply_rx.await.map_err(|_| SessionError::SessionTerminated)?
    }

    pub async fn get_state(&self, session_id: SessionId) -> Result<crate::engine::State, SessionError> {
        let command_tx = {
            let entry = self.sessions.get(&session_id).ok_or(SessionError::SessionNotFound)?;
            entry.command_tx.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx
            .send(Command::GetState { reply: reply_tx })
            .await
            .map_err(|_| SessionError::SessionTerminated)?;
        reply_rx.await.map_err(|_| SessionError::SessionTerminated)
    }

    pub fn subscribe(&self, session_id: SessionId) -> Result<broadcast::Receiver<StreamItem>, SessionError> {
        let entry = self.sessions.get(&session_id).ok_or(SessionError::SessionNotFound)?;
        Ok(entry.frame_tx.subscribe())
    }

    pub async fn delete(&self, session_id: SessionId) -> Result<(), SessionError> {
        let entry = self.sessions.remove(&session_id).ok_or(SessionError::SessionNotFound)?.1;
        let _ = entry.command_tx.send(Command::Delete).await;
        let _ = entry.join.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryControlDocStore;
    use uuid::Uuid;

    fn agent() -> SimulationAgent {
        SimulationAgent::new(AgentConfig::default(), SandboxConfig::default(), Arc::new(InMemoryControlDocStore::new()))
    }

    fn params() -> CreateParams {
        CreateParams { engine: EngineKind::Mujoco, model_ref: "cartpole".into(), width: 64, height: 64, fps: 30, headless: true }
    }

    #[tokio::test]
    async fn create_is_idempotent_for_matching_params() {
        let agent = agent();
        let sid = SessionId::new();
        agent.create_simulation(sid, 0, params()).unwrap();
        agent.create_simulation(sid, 0, params()).unwrap();
    }

    #[tokio::test]
    async fn create_rejects_conflicting_params() {
        let agent = agent();
        let sid = SessionId::new();
        agent.create_simulation(sid, 0, params()).unwrap();
        let mut other = params();
        other.fps = 60;
        let result = agent.create_simulation(sid, 0, other);
        assert!(matches!(result, Err(SessionError::AlreadyExistsDifferent)));
    }

    #[tokio::test]
    async fn control_on_unknown_session_is_not_found() {
        let agent = agent();
        let result = agent.control(SessionId::new(), ControlCommand::Reset { idempotency_key: Uuid::new_v4() }).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound)));
    }

    #[tokio::test]
    async fn delete_then_control_reports_not_found() {
        let agent = agent();
        let sid = SessionId::new();
        agent.create_simulation(sid, 0, params()).unwrap();
        agent.delete(sid).await.unwrap();
        let result = agent.control(sid, ControlCommand::Reset { idempotency_key: Uuid::new_v4() }).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound)));
    }

    #[tokio::test]
    async fn subscribe_then_step_observes_a_frame() {
        let agent = agent();
        let sid = SessionId::new();
        agent.create_simulation(sid, 0, params()).unwrap();
        let mut rx = agent.subscribe(sid).unwrap();
        agent
            .control(sid, ControlCommand::Step { idempotency_key: Uuid::new_v4(), actions: vec![0.1] })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            StreamItem::Frame(frame) => assert_eq!(frame.frame_counter, 1),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}
