//! Inference sessions and their pool.

pub mod backend;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod pool;

pub use backend::{default_backend, InferenceSession, SessionBackend, Tensor, UnavailableBackend};
#[cfg(feature = "onnx")]
pub use onnx::{OrtBackend, OrtSession};
pub use pool::{guarded_factory, PoolConfig, PoolStats, SessionHandle, SessionPool};
