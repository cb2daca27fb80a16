//! Publish/subscribe message broker: validated envelopes, filtered local
//! subscriptions, store-backed fan-out between nodes, and rolling stats.

pub mod service;

pub use service::{BrokerStats, MessageBroker, SubscriptionId};
