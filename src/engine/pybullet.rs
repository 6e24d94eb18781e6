//! PyBullet adapter. Selects the tiny-renderer when headless, hardware GL
//! otherwise; the tiny-renderer's offscreen ceiling is lower
//! than the hardware-GL path's.

use super::{resolve_model, synthetic_frame_bytes, CameraParams, Dims, EngineAdapter, State};
use crate::errors::EngineError;
use crate::model::EngineKind;

const TINY_RENDERER_MAX_DIM: u32 = 1024;
const HARDWARE_GL_MAX_DIM: u32 = 4096;
const TIMESTEP: f64 = 1.0 / 240.0;

pub struct PybulletAdapter {
    digest: String,
    dims: Dims,
    fps: u32,
    dof: usize,
    nu: usize,
    positions: Vec<f64>,
    velocities: Vec<f64>,
    physics_time: f64,
    frame_counter: u64,
    camera: CameraParams,
}

impl PybulletAdapter {
    pub fn load(model_ref: &str, dims: Dims, fps: u32, headless: bool) -> Result<Self, EngineError> {
        let ceiling = if headless { TINY_RENDERER_MAX_DIM } else { HARDWARE_GL_MAX_DIM };
        if dims.width > ceiling || dims.height > ceiling {
            return Err(EngineError::FramebufferTooSmall);
        }
        let spec = resolve_model(model_ref)?;
        Ok(PybulletAdapter {
            digest: spec.digest,
            dims,
            fps,
            dof: spec.dof,
            nu: spec.nu,
            positions: vec![0.0; spec.dof],
            velocities: vec![0.0; spec.dof],
            physics_time: 0.0,
            frame_counter: 0,
            camera: CameraParams { distance: 2.0, yaw: 0.0, pitch: -30.0, target: [0.0; 3] },
        })
    }
}

impl EngineAdapter for PybulletAdapter {
    fn engine_kind(&self) -> EngineKind {
        EngineKind::Pybullet
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
        for i in 0..self.dof {
            let force = actions.get(i).copied().unwrap_or(0.0);
            self.velocities[i] = self.velocities[i] * 0.995 + force * TIMESTEP;
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

    fn set_camera(&mut self, params: CameraParams) -> Result<(), EngineError> {
        self.camera = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(w: u32, h: u32) -> Dims {
        Dims { width: w, height: h }
    }

    #[test]
    fn headless_uses_the_tighter_tiny_renderer_ceiling() {
        let result = PybulletAdapter::load("cartpole", dims(2048, 2048), 60, true);
        assert!(matches!(result, Err(EngineError::FramebufferTooSmall)));
        let ok = PybulletAdapter::load("cartpole", dims(2048, 2048), 60, false);
        assert!(ok.is_ok());
    }

    #[test]
    fn set_camera_is_supported() {
        let mut adapter = PybulletAdapter::load("cartpole", dims(64, 64), 60, true).unwrap();
        adapter
            .set_camera(CameraParams { distance: 5.0, yaw: 45.0, pitch: -10.0, target: [1.0, 0.0, 0.0] })
            .unwrap();
        assert_eq!(adapter.camera.distance, 5.0);
    }

    #[test]
    fn model_not_found_surfaces() {
        let result = PybulletAdapter::load("no-such-model", dims(64, 64), 60, true);
        assert!(matches!(result, Err(EngineError::ModelNotFound)));
    }
}
