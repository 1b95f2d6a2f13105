//! Built-in tool implementations.
//!
//! The core only cares about a plugin's input/output contract, so this
//! crate carries the two bodies the broker/worker pool need to exercise
//! that contract end to end, registered under the `tool.kind` values a
//! playbook actually declares:
//! - `script` - execute a shell command (`ToolKind::Script`)
//! - `http` - make an HTTP request (`ToolKind::Http`)
//!
//! Other plugin kinds a playbook may name (`python`, `snowflake`, `duckdb`,
//! ...) are dispatched by `kind` the same way but have no body here.

mod http;
mod shell;

pub use self::http::HttpTool;
pub use self::shell::ShellTool;

use crate::registry::ToolRegistry;

/// Create a tool registry with all built-in tools registered.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(ShellTool::new());
    registry.register(HttpTool::new());

    registry
}
