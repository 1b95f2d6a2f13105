//! Event report construction for the worker's completion path.

mod emitter;

pub use emitter::{action_completed, action_failed, action_started, NodeIdentity};
