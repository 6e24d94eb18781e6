//! MuJoCo adapter. MuJoCo requires headless GL (EGL) with an offscreen
//! buffer at least as large as the requested dimensions.

use super::{resolve_model, synthetic_frame_bytes, CameraParams, Dims, EngineAdapter, State};
use crate::errors::EngineError;
use crate::model::EngineKind;

/// EGL headless offscreen buffer ceiling this simulated adapter honors.
const MAX_OFFSCREEN_DIM: u32 = 2048;
const TIMESTEP: f64 = 0.002;

pub struct MujocoAdapter {
    digest: String,
    dims: Dims,
    fps: u32,
    dof: usize,
    nu: usize,
    positions: Vec<f64>,
    velocities: Vec<f64>,
    physics_time: f64,
    frame_counter: u64,
}

impl MujocoAdapter {
    pub fn load(model_ref: &str, dims: Dims, fps: u32, headless: bool) -> Result<Self, EngineError> {
        if headless && (dims.width > MAX_OFFSCREEN_DIM || dims.height > MAX_OFFSCREEN_DIM) {
            return Err(EngineError::FramebufferTooSmall);
        }
        let spec = resolve_model(model_ref)?;
        Ok(MujocoAdapter {
            digest: spec.digest,
            dims,
            fps,
            dof: spec.dof,
            nu: spec.nu,
            positions: vec![0.0; spec.dof],
            velocities: vec![0.0; spec.dof],
            physics_time: 0.0,
            frame_counter: 0,
        })
    }
}

impl EngineAdapter for MujocoAdapter {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Mujoco
    }

    fn model_digest(&self) -> &str {
        &self.digest
    }

    fn dims(&self) -> Dims {
        self.dims
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn reset(&mut self) -> State {
        self.positions = vec![0.0; self.dof];
        self.velocities = vec![0.0; self.dof];
        self.physics_time = 0.0;
        self.frame_counter = 0;
        self.state()
    }

    fn step(&mut self, actions: &[f64]) -> Result<State, EngineError> {
        if actions.len() != self.nu {
            return Err(EngineError::ActionShapeError);
        }
        // Semi-implicit Euler integration with light damping, applying
        // each actuator's force to its matching degree of freedom.
        for i in 0..self.dof {
            let force = actions.get(i).copied().unwrap_or(0.0);
            self.velocities[i] = self.velocities[i] * 0.999 + force * TIMESTEP;
            self.positions[i] += self.velocities[i] * TIMESTEP;
        }
        self.physics_time += TIMESTEP;
        self.frame_counter += 1;
        Ok(self.state())
    }

    fn render(&self) -> (Vec<u8>, &'static str) {
        (
            synthetic_frame_bytes(self.dims, self.frame_counter, &self.positions),
            "jpeg",
        )
    }

    fn state(&self) -> State {
        State {
            positions: self.positions.clone(),
            velocities: self.velocities.clone(),
            physics_time: self.physics_time,
            frame_counter: self.frame_counter,
            nu: self.nu,
        }
    }

    fn set_camera(&mut self, _params: CameraParams) -> Result<(), EngineError> {
        Err(EngineError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(w: u32, h: u32) -> Dims {
        Dims { width: w, height: h }
    }

    #[test]
    fn oversized_offscreen_buffer_rejected() {
        let result = MujocoAdapter::load("cartpole", dims(4096, 4096), 30, true);
        assert!(matches!(result, Err(EngineError::FramebufferTooSmall)));
    }

    #[test]
    fn reset_zeroes_time_and_counter_but_not_digest() {
        let mut adapter = MujocoAdapter::load("cartpole", dims(64, 64), 30, true).unwrap();
        adapter.step(&[1.0]).unwrap();
        let digest_before = adapter.model_digest().to_string();
        let state = adapter.reset();
        assert_eq!(state.frame_counter, 0);
        assert_eq!(state.physics_time, 0.0);
        assert_eq!(adapter.model_digest(), digest_before);
    }

    #[test]
    fn wrong_action_shape_leaves_state_unchanged() {
        let mut adapter = MujocoAdapter::load("cartpole", dims(64, 64), 30, true).unwrap();
        let before = adapter.state();
        let err = adapter.step(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, EngineError::ActionShapeError));
        let after = adapter.state();
        assert_eq!(before.frame_counter, after.frame_counter);
        assert_eq!(before.positions, after.positions);
    }

    #[test]
    fn set_camera_not_supported() {
        let mut adapter = MujocoAdapter::load("cartpole", dims(64, 64), 30, true).unwrap();
        let err = adapter
            .set_camera(CameraParams { distance: 1.0, yaw: 0.0, pitch: 0.0, target: [0.0; 3] })
            .unwrap_err();
        assert!(matches!(err, EngineError::NotSupported));
    }

    #[test]
    fn render_does_not_require_stepping() {
        let adapter = MujocoAdapter::load("cartpole", dims(64, 64), 30, true).unwrap();
        let (bytes, encoding) = adapter.render();
        assert!(!bytes.is_empty());
        assert_eq!(encoding, "jpeg");
    }
}
