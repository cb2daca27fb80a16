//! Per-node worker pool.
//!
//! The pool polls the task queue on an interval, dispatches each dequeued
//! task to the first idle agent registered for its type and settles the
//! task back into the queue when the agent finishes. Concurrency is bounded
//! by `max_concurrent`; a node-scoped control topic allows stopping,
//! starting and reconfiguring the pool remotely.

pub mod agents;
pub mod service;

pub use agents::{create_builtin_agent, EchoAgent, ShellAgent, ShellParams};
pub use service::{PoolEvent, PoolSettings, WorkerPool, WorkerPoolBuilder};
