//! Simulation Engine Adapter: a uniform interface over
//! MuJoCo and PyBullet. The real native libraries are external binary
//! dependencies outside this repository's scope; both adapters
//! below simulate the documented contract deterministically so every
//! ordering, error, and invariant rule is fully exercised.

pub mod mujoco;
pub mod pybullet;

use crate::errors::EngineError;
use crate::model::EngineKind;
use serde::{Deserialize, Serialize};

/// Framebuffer dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

/// Camera parameters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CameraParams {
    pub distance: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub target: [f64; 3],
}

/// `{positions, velocities, physics_time, frame_counter, nu}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct State {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
    pub physics_time: f64,
    pub frame_counter: u64,
    pub nu: usize,
}

/// A loaded model's static shape: actuator/DOF counts fixed at
/// construction.
#[derive(Clone, Debug)]
struct ModelSpec {
    digest: String,
    dof: usize,
    nu: usize,
}

/// Tiny in-memory model store standing in for the read-only model store
///. `bad:`-prefixed
/// refs simulate a corrupt model for `ModelParseError` coverage.
fn resolve_model(model_ref: &str) -> Result<ModelSpec, EngineError> {
    if let Some(rest) = model_ref.strip_prefix("bad:") {
        let _ = rest;
        return Err(EngineError::ModelParseError);
    }
    let (dof, nu) = match model_ref {
        "cartpole" => (2, 1),
        "pendulum" => (1, 1),
        "quadruped" => (12, 8),
        "arm6dof" => (6, 6),
        _ => return Err(EngineError::ModelNotFound),
    };
    Ok(ModelSpec {
        digest: format!("{model_ref}@v1"),
        dof,
        nu,
    })
}

/// Uniform surface over the two supported engines. All calls
/// for a given session are serialized on that session's producer task
///, so `&mut self` is sufficient — no internal locking needed.
pub trait EngineAdapter: Send {
    fn engine_kind(&self) -> EngineKind;
    fn model_digest(&self) -> &str;
    fn dims(&self) -> Dims;
    fn fps(&self) -> u32;

    /// Zeroes physics time and frame counter; reinitializes state to
    /// model defaults. Does not change the model digest.
    fn reset(&mut self) -> State;

    /// Advances physics by one timestep. `actions` must match the
    /// actuator count (`nu`); otherwise `ActionShapeError`, leaving state
    /// unchanged.
    fn step(&mut self, actions: &[f64]) -> Result<State, EngineError>;

    /// Encoded image of the current scene; callable without stepping.
    fn render(&self) -> (Vec<u8>, &'static str);

    fn state(&self) -> State;

    /// PyBullet only; MuJoCo returns `NotSupported`.
    fn set_camera(&mut self, params: CameraParams) -> Result<(), EngineError>;
}

/// Produces a synthetic but stable JPEG-tagged byte buffer: a small
/// deterministic digest of the current state rather than real pixels,
/// since no GPU/EGL stack is linked in this repository.
fn synthetic_frame_bytes(dims: Dims, frame_counter: u64, positions: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + positions.len() * 8);
    bytes.extend_from_slice(&dims.width.to_le_bytes());
    bytes.extend_from_slice(&dims.height.to_le_bytes());
    bytes.extend_from_slice(&frame_counter.to_le_bytes());
    for p in positions {
        bytes.extend_from_slice(&p.to_le_bytes());
    }
    bytes
}

/// `load(model_ref, dims, fps) -> EngineInstance | ModelLoadError`.
/// Dispatches to the requested engine's offscreen-buffer check and
/// construction.
pub fn load(
    kind: EngineKind,
    model_ref: &str,
    dims: Dims,
    fps: u32,
    headless: bool,
) -> Result<Box<dyn EngineAdapter>, EngineError> {
    match kind {
        EngineKind::Mujoco => mujoco::MujocoAdapter::load(model_ref, dims, fps, headless)
            .map(|a| Box::new(a) as Box<dyn EngineAdapter>),
        EngineKind::Pybullet => pybullet::PybulletAdapter::load(model_ref, dims, fps, headless)
            .map(|a| Box::new(a) as Box<dyn EngineAdapter>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_is_not_found() {
        assert!(matches!(
            resolve_model("no-such-model"),
            Err(EngineError::ModelNotFound)
        ));
    }

    #[test]
    fn bad_prefixed_model_fails_to_parse() {
        assert!(matches!(
            resolve_model("bad:cartpole"),
            Err(EngineError::ModelParseError)
        ));
    }
}
