//! Port assignment, conflict detection and process-tree termination.

mod conflict;
mod manager;
mod process;
mod prompt;
mod store;

pub use conflict::{is_port_available, PortConflict};
pub use manager::*;
#[cfg(unix)]
pub use process::UnixProcessController;
pub use process::{
    collect_tree, default_controller, kill_process_tree, ProcessController, ProcessInfo,
    WindowsProcessController, KILL_GRACE_PERIOD,
};
pub use prompt::{is_interactive, ConflictDecision, ConflictPrompt, StaticPrompt, TerminalPrompt};
pub use store::*;
