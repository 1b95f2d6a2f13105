//! NoETL Worker Pool
//!
//! Leases queue jobs from the control plane and executes their actions.
//!
//! This crate provides:
//! - an HTTP client speaking the lease/heartbeat/complete/fail queue contract
//! - a job executor dispatching leased actions to the tool registry
//! - event builders for `action_started`/`action_completed`/`action_failed`
//! - an optional NATS subscription that wakes the poll loop early

pub mod client;
pub mod config;
pub mod events;
pub mod executor;
pub mod nats;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
