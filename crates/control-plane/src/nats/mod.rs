//! Queue wake-up notifications for NoETL's control plane (core NATS
//! pub/sub, see [`publisher`]).

pub mod publisher;

pub use publisher::NatsPublisher;
