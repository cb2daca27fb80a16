//! Cluster coordination: the shared worker registry, heartbeats, read-time
//! liveness, load rebalancing and redistribution claims.

pub mod service;

pub use service::{generate_node_id, Coordinator};
