//! Control plane HTTP client.

mod control_plane;

pub use control_plane::{ControlPlaneClient, EventCreateRequest, Leased, QueueJob};
