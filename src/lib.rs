//! Node assembly for the taskmesh binary.
//!
//! The library surface exists so integration tests can wire a full node
//! exactly the way `main` does.

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
