//! Leveled startup, readiness gating and per-service lifecycle control.

mod core;
mod operations;
mod report;

pub use self::core::{Orchestrator, Target};
pub use operations::{
    BulkOperationResult, OperationKind, OperationManager, OperationResult, OperationState,
};
pub use report::{NotStarted, ServiceFailure, StartupReport};
