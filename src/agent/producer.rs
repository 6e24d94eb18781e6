//! The producer loop: one cooperative task per session generation, owning
//! the `EngineAdapter` exclusively. Drives the engine at
//! the target FPS while `Play`, or steps on demand otherwise, publishing
//! `(generation, frame_counter, bytes)` to every subscriber.

use crate::engine::EngineAdapter;
use crate::errors::{EngineError, SessionError};
use crate::external::{ControlDocWatcher, StepMode};
use crate::model::{ControlCommand, SessionId, StreamItem};
use crate::sandbox::{self, ExecuteResult, Limits};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
}

/// Reply to a `Control` RPC: the post-command engine state, a sandbox
/// result when the command was `Execute`, or an engine-level fault
/// (`ActionShapeError` on a malformed `Step`, `NotSupported` on a
/// `SetCamera` the active engine doesn't implement) carried alongside the
/// state from just before the faulting command.
#[derive(Debug)]
pub enum ControlReply {
    State(crate::engine::State),
    Executed(ExecuteResult),
    Faulted { error: EngineError, state: crate::engine::State },
}

pub enum Command {
    Control { command: ControlCommand, reply: oneshot::Sender<Result<ControlReply, SessionError>> },
    GetState { reply: oneshot::Sender<crate::engine::State> },
    Delete,
}

pub struct ProducerHandle {
    pub command_tx: mpsc::Sender<Command>,
    pub frame_tx: broadcast::Sender<StreamItem>,
}

struct IdempotencyCache {
    seen: HashMap<Uuid, ()>,
    order: std::collections::VecDeque<Uuid>,
    capacity: usize,
}

impl IdempotencyCache {
    fn new(capacity: usize) -> Self {
        IdempotencyCache { seen: HashMap::new(), order: std::collections::VecDeque::new(), capacity }
    }

    /// Returns `true` the first time a key is seen; `false` on replay, so
    /// the caller applies a command's effects at most once.
    fn first_time(&mut self, key: Uuid) -> bool {
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, ());
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub struct ProducerLoop {
    pub session_id: SessionId,
    pub generation: u64,
    pub engine: Box<dyn EngineAdapter>,
    pub fps: u32,
    pub sandbox_limits: Limits,
    pub sandbox_grace: Duration,
    pub control_docs: Arc<dyn ControlDocWatcher>,
    pub command_rx: mpsc::Receiver<Command>,
    pub frame_tx: broadcast::Sender<StreamItem>,
}

impl ProducerLoop {
    pub async fn run(mut self) {
        let mut play_state = PlayState::Paused;
        let mut step_mode = StepMode::Continuous;
        let mut last_action: Vec<f64> = vec![0.0; self.engine.state().nu];
        let mut idempotency = IdempotencyCache::new(256);
        let mut ticker = tokio::time::interval(fps_period(self.fps));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                maybe_cmd = self.command_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Delete) | None => {
                            info!(session_id = %self.session_id, "producer loop stopping");
                            return;
                        }
                        Some(Command::GetState { reply }) => {
                            let _ = reply.send(self.engine.state());
                        }
                        Some(Command::Control { command, reply }) => {
                            if !idempotency.first_time(command.idempotency_key()) {
                                // Replayed key: apply the effect at most once and
                                // report the current state rather than re-deriving
                                // a cached reply.
                                let _ = reply.send(Ok(ControlReply::State(self.engine.state())));
                                continue;
                            }
                            let outcome = self.apply_control(command, &mut play_state, &mut last_action).await;
                            let _ = reply.send(Ok(outcome));
                        }
                    }
                }

                _ = ticker.tick(), if play_state == PlayState::Playing => {
                    self.apply_control_doc(&mut play_state, &mut step_mode).await;
                    if play_state != PlayState::Playing || step_mode == StepMode::Manual {
                        continue;
                    }
                    match self.engine.step(&last_action) {
                        Ok(_) => self.publish_frame(),
                        Err(fault) => {
                            warn!(session_id = %self.session_id, error = %fault, "producer faulted");
                            let _ = self.frame_tx.send(StreamItem::Faulted);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Applies the control document's `play` and `step_mode` keys.
    /// `seed` and `scenario_id` are recognized but inert here: they take
    /// effect only at `CreateSimulation` time (via `model_ref`/engine
    /// setup), not as a live knob a running producer reacts to.
    async fn apply_control_doc(&mut self, play_state: &mut PlayState, step_mode: &mut StepMode) {
        let doc = self.control_docs.current(self.session_id).await;
        if let Some(play) = doc.play {
            *play_state = if play { PlayState::Playing } else { PlayState::Paused };
        }
        if let Some(mode) = doc.step_mode {
            *step_mode = mode;
        }
    }

    async fn apply_control(
        &mut self,
        command: ControlCommand,
        play_state: &mut PlayState,
        last_action: &mut Vec<f64>,
    ) -> ControlReply {
        match command {
            ControlCommand::Reset { .. } => {
                let state = self.engine.reset();
                // Generation never changes on Reset;
                // subscribers observe the discontinuity via this marker.
                let _ = self.frame_tx.send(StreamItem::Reset { generation: self.generation });
                ControlReply::State(state)
            }
            ControlCommand::Step { actions, .. } => match self.engine.step(&actions) {
                Ok(state) => {
                    self.publish_frame();
                    ControlReply::State(state)
                }
                Err(error) => ControlReply::Faulted { error, state: self.engine.state() },
            },
            ControlCommand::Play { .. } => {
                *play_state = PlayState::Playing;
                ControlReply::State(self.engine.state())
            }
            ControlCommand::Pause { .. } => {
                *play_state = PlayState::Paused;
                ControlReply::State(self.engine.state())
            }
            ControlCommand::SetCamera { distance, yaw, pitch, target, .. } => {
                match self.engine.set_camera(crate::engine::CameraParams { distance, yaw, pitch, target }) {
                    Ok(_) => ControlReply::State(self.engine.state()),
                    Err(error) => ControlReply::Faulted { error, state: self.engine.state() },
                }
            }
            ControlCommand::Execute { source, language, timeout_ms, .. } => {
                let limits = Limits { timeout: Duration::from_millis(timeout_ms), ..self.sandbox_limits };
                let result = sandbox::execute(&source, &language, limits, self.sandbox_grace, self.engine.as_mut()).await;
                if result.status == sandbox::Status::Ok {
                    self.publish_frame();
                }
                *last_action = vec![0.0; self.engine.state().nu];
                ControlReply::Executed(result)
            }
        }
    }

    fn publish_frame(&self) {
        let state = self.engine.state();
        let (bytes, encoding) = self.engine.render();
        let frame = crate::model::Frame {
            session_id: self.session_id,
            generation: self.generation,
            frame_counter: state.frame_counter,
            physics_time: state.physics_time,
            encoding: encoding.to_string(),
            bytes,
        };
        let _ = self.frame_tx.send(StreamItem::Frame(frame));
    }
}

fn fps_period(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{self, Dims};
    use crate::external::InMemoryControlDocStore;
    use crate::model::EngineKind;

    fn spawn_loop() -> (ProducerHandle, tokio::task::JoinHandle<()>, SessionId) {
        let session_id = SessionId::new();
        let engine = engine::load(EngineKind::Mujoco, "cartpole", Dims { width: 64, height: 64 }, 30, true).unwrap();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (frame_tx, _) = broadcast::channel(64);
        let producer = ProducerLoop {
            session_id,
            generation: 0,
            engine,
            fps: 30,
            sandbox_limits: Limits { timeout: Duration::from_millis(500), memory_bytes: u64::MAX, stdout_cap_bytes: 4096 },
            sandbox_grace: Duration::from_millis(250),
            control_docs: Arc::new(InMemoryControlDocStore::new()),
            command_rx,
            frame_tx: frame_tx.clone(),
        };
        let handle = ProducerHandle { command_tx, frame_tx };
        let join = tokio::spawn(producer.run());
        (handle, join, session_id)
    }

    #[tokio::test]
    async fn reset_then_step_emits_marker_before_zeroed_frame() {
        let (handle, join, _sid) = spawn_loop();
        let mut subscriber = handle.frame_tx.subscribe();

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Control {
                command: ControlCommand::Reset { idempotency_key: Uuid::new_v4() },
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();

        match subscriber.recv().await.unwrap() {
            StreamItem::Reset { generation } => assert_eq!(generation, 0),
            other => panic!("expected reset marker, got {other:?}"),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Control {
                command: ControlCommand::Step { idempotency_key: Uuid::new_v4(), actions: vec![0.5] },
                reply: reply_tx,
            })
            .await
            .unwrap();
        reply_rx.await.unwrap().unwrap();

        match subscriber.recv().await.unwrap() {
            StreamItem::Frame(frame) => {
                assert_eq!(frame.frame_counter, 1);
            }
            other => panic!("expected a frame, got {other:?}"),
        }

        handle.command_tx.send(Command::Delete).await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn repeated_idempotency_key_applies_effect_once() {
        let (handle, join, _sid) = spawn_loop();
        let key = Uuid::new_v4();

        let (tx1, rx1) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Control { command: ControlCommand::Step { idempotency_key: key, actions: vec![1.0] }, reply: tx1 })
            .await
            .unwrap();
        let first = rx1.await.unwrap().unwrap();

        let (tx2, rx2) = oneshot::channel();
        handle
            .command_tx
            .send(Command::Control { command: ControlCommand::Step { idempotency_key: key, actions: vec![1.0] }, reply: tx2 })
            .await
            .unwrap();
        let second = rx2.await.unwrap().unwrap();

        match (first, second) {
            (ControlReply::State(a), ControlReply::State(b)) => assert_eq!(a.frame_counter, b.frame_counter),
            _ => panic!("expected state replies"),
        }

        handle.command_tx.send(Command::Delete).await.unwrap();
        join.await.unwrap();
    }
}
