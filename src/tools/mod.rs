pub mod base;
pub mod exec;
pub mod filesystem;
pub mod planning;
pub mod registry;
pub mod setup;
pub mod spawn;
pub mod web;

pub use base::{ContentPart, ExecutionContext, Tool, ToolResult, ToolStatus};
pub use registry::ToolRegistry;
pub use setup::SandboxedTools;
