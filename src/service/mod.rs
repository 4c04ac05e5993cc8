//! Service descriptions and the executors that run them.
//!
//! - [`Executor`]: the seam between the orchestrator and a runtime backend
//! - [`ProcessExecutor`]: local child processes
//! - [`LaunchSpec`] / [`ServiceHandle`]: what is launched and what comes back

mod executor;
mod log_capture;
mod process;
mod types;

pub use executor::*;
pub use log_capture::*;
pub use process::*;
pub use types::*;
