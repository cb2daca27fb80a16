//! Priority task queue.
//!
//! All queue state lives in the shared [`TaskStore`], so any node in the
//! cluster can enqueue, dequeue and settle tasks. The atomic pop of the
//! pending set is the only cross-node mutual exclusion in the system;
//! everything downstream of a dequeue belongs to exactly one node until the
//! task is completed, failed or its lease expires.
//!
//! [`TaskStore`]: taskmesh_domain::ports::TaskStore

pub mod service;

pub use service::TaskQueue;
