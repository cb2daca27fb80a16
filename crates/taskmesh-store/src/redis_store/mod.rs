pub mod connection;
pub mod store;

pub use connection::RedisConnection;
pub use store::RedisTaskStore;
