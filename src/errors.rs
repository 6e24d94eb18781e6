//! Error taxonomy for the CoSim control plane.
//!
//! Each component gets its own enum so that callers can match on the
//! specific failure category without unwrapping nested strings. Display
//! messages name the reason category only, never raw engine/library text.

use serde::Serialize;
use thiserror::Error;

/// Admission-time rejection of a session request.
#[derive(Debug, Clone, Error, Serialize)]
pub enum AdmissionError {
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },
    #[error("quota exceeded: {sub_reason}")]
    QuotaExceeded { sub_reason: QuotaSubReason },
}

/// Sub-reason attached to `QuotaExceeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaSubReason {
    Concurrent,
    GpuConcurrent,
    CpuMinuteCap,
    GpuMinuteCap,
}

impl std::fmt::Display for QuotaSubReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuotaSubReason::Concurrent => "concurrent",
            QuotaSubReason::GpuConcurrent => "gpu_concurrent",
            QuotaSubReason::CpuMinuteCap => "cpu_minute_cap",
            QuotaSubReason::GpuMinuteCap => "gpu_minute_cap",
        };
        f.write_str(s)
    }
}

/// Pod scheduling / allocation failures. Recovered locally up to the
/// restart budget before a session is surfaced as `Failed`.
#[derive(Debug, Clone, Error, Serialize)]
pub enum SchedulingError {
    #[error("allocator unavailable")]
    AllocatorUnavailable,
    #[error("image pull failed")]
    ImagePullFailed,
    #[error("boot timed out")]
    BootTimeout,
}

/// Simulation Engine Adapter (C1) failures.
#[derive(Debug, Clone, Error, Serialize)]
pub enum EngineError {
    #[error("model not found")]
    ModelNotFound,
    #[error("model parse error")]
    ModelParseError,
    #[error("requested framebuffer exceeds engine's offscreen buffer")]
    FramebufferTooSmall,
    #[error("action vector does not match actuator count")]
    ActionShapeError,
    #[error("operation not supported by this engine")]
    NotSupported,
}

/// User-Code Sandbox (C2) failures.
#[derive(Debug, Clone, Error, Serialize)]
pub enum SandboxError {
    #[error("execution timed out")]
    Timeout,
    #[error("memory limit exceeded")]
    MemoryExceeded,
    #[error("runtime fault")]
    RuntimeFault,
    #[error("syntax error")]
    SyntaxError,
    #[error("unsupported language")]
    UnsupportedLanguage,
}

/// Session lifecycle errors.
#[derive(Debug, Clone, Error, Serialize)]
pub enum SessionError {
    #[error("an existing session has conflicting parameters")]
    AlreadyExistsDifferent,
    #[error("session not found")]
    SessionNotFound,
    #[error("session already terminated")]
    SessionTerminated,
    #[error("model load failed: {0}")]
    ModelLoadFailed(#[from] EngineError),
}

/// Media Signaling Plane (C4) failures.
#[derive(Debug, Clone, Error, Serialize)]
pub enum SignalingError {
    #[error("room already has a broadcaster")]
    BroadcasterPresent,
    #[error("room not found")]
    RoomNotFound,
    #[error("peer unknown")]
    PeerUnknown,
}

/// Transport-level failures, orthogonal to the categories above.
#[derive(Debug, Clone, Error, Serialize)]
pub enum TransportError {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("canceled")]
    Canceled,
    #[error("internal error")]
    Internal,
}

/// Top-level error composing every component category, used at the API
/// boundary so axum handlers have one `From` chain to map into HTTP status.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "error", content = "detail")]
pub enum CosimError {
    #[error("admission: {0}")]
    Admission(#[from] AdmissionError),
    #[error("scheduling: {0}")]
    Scheduling(#[from] SchedulingError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
