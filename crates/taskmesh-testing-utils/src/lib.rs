//! Shared testing utilities for the taskmesh workspace.
//!
//! Provides scripted [`Agent`] doubles with observable state, builders for
//! test entities and small async helpers. Add as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! taskmesh-testing-utils = { path = "../taskmesh-testing-utils" }
//! ```
//!
//! [`Agent`]: taskmesh_domain::agent::Agent

pub mod agents;
pub mod builders;
pub mod helpers;

pub use agents::{FailingAgent, SleepAgent, SucceedingAgent};
pub use builders::{broadcast_message, direct_message, task_draft, BrokerMessageBuilder};
pub use helpers::eventually;
