//! Core domain types for TaskMesh: tasks, worker nodes, broker messages,
//! event topics, the agent capability trait and the shared store port.
//!
//! This crate defines the contracts; concrete store backends live in
//! `taskmesh-store` and the services that drive these types live in the
//! queue, worker, cluster and broker crates.

pub mod agent;
pub mod entities;
pub mod events;
pub mod ports;

pub use agent::*;
pub use entities::*;
pub use events::*;
pub use ports::*;
pub use taskmesh_errors::{TaskMeshError, TaskMeshResult};
