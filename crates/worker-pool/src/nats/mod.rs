//! Optional NATS wake-up fast path for the lease-poll loop.

mod subscriber;

pub use subscriber::{run_wake_listener, WAKE_SUBJECT};
