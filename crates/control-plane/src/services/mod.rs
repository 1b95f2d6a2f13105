//! Service layer for the NoETL Control Plane.
//!
//! Services encapsulate business logic and coordinate
//! between handlers and database queries.

pub mod catalog;
pub mod context;
pub mod credential;
pub mod event;
pub mod execution;
pub mod keychain;
pub mod queue;
pub mod runtime;

pub use catalog::CatalogService;
pub use context::ContextService;
pub use credential::CredentialService;
pub use event::EventService;
pub use execution::ExecutionService;
pub use keychain::KeychainService;
pub use queue::QueueService;
pub use runtime::RuntimeService;
