//! Additional node handlers beyond the basic start/exit/conditional.

pub mod codergen_handler;
pub mod tool_handler;
pub mod wait_human;
pub mod workspace;

pub use codergen_handler::CodergenHandler;
pub use tool_handler::ToolHandler;
pub use workspace::{WorkspaceCleanupHandler, WorkspaceCreateHandler, WorkspaceMergeHandler};

// ---------------------------------------------------------------------------
// Shared test helpers used by child handler modules
// ---------------------------------------------------------------------------
