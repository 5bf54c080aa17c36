//! Off-thread action execution.
//!
//! A worker hosts a mirror [`tessera_engine::Engine`] initialized from a
//! snapshot sent by the main side. Communication is frame-per-frame,
//! correlated by request id; the main thread is never blocked on a worker
//! frame, and results are delivered in request order.

mod frames;
mod worker;

pub use frames::{FrameResult, WorkerFrame};
pub use worker::{Worker, WorkerConfig, WorkerError, WorkerHandle};

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
