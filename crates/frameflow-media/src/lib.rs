//! Inference sessions, frame I/O and processing steps for frameflow.
//!
//! This crate provides:
//! - `SessionPool`: keyed, single-flight cache of expensive sessions
//! - Inference backend traits with an optional ONNX Runtime backend
//! - Model resolution with checksum verification
//! - Frame source/sink interfaces with in-memory and raw-directory impls
//! - The `ProcessingStep` trait and the runtime `StepRegistry`

pub mod error;
pub mod frame;
pub mod model;
pub mod session;
pub mod step;

pub use error::{MediaError, MediaResult};
pub use frame::{
    Frame, FrameSink, FrameSource, MemoryFrameSink, MemoryFrameSource, RawFrameDirectory,
    RawFrameLayout, RawFrameWriter,
};
pub use model::{LocalModelProvider, ModelProvider, ModelSpec};
pub use session::{
    default_backend, guarded_factory, InferenceSession, PoolConfig, PoolStats, SessionBackend,
    SessionHandle, SessionPool, Tensor, UnavailableBackend,
};
pub use step::{
    collect_step_state, InferenceSessionPool, ProcessingStep, StepConstructor, StepContext,
    StepRegistry,
};
