//! The asynchronous task engine
//!
//! Every mutating operation is a persisted task record, dispatched through a
//! per-backend worker pool, executed under its own timeout, cancellable, and
//! recoverable across process restarts. Handlers run inside a spawned task
//! so a panic is contained and becomes a `failed` terminal state.

pub mod context;
pub mod create;
pub mod delete;
pub mod engine;
pub mod error;
pub mod pool;
pub mod ports_task;
pub mod reset;

pub use context::{DriverProvider, EngineConfig, HandlerOutcome, TaskContext};
pub use engine::TaskEngine;
pub use error::{Result, TaskError};
pub use pool::{TaskRunner, WorkerPool};
