// thiserror's Display for struct variants trips unused_assignments
#![allow(unused_assignments)]

use crate::orchestrator::StartupReport;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(stackup::config::validation),
        help("Run `stackup plan` to see how your stack file is interpreted")
    )]
    Validation(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Circular dependency detected between: {}", .0.join(", "))]
    #[diagnostic(
        code(stackup::dependency::circular),
        help("Services cannot depend on each other in a cycle. Review the `uses` lists of these services")
    )]
    CircularDependency(Vec<String>),

    #[error("Service '{service}' uses '{missing}', which is not declared")]
    #[diagnostic(
        code(stackup::dependency::missing),
        help("Declare '{missing}' under `services:` or remove it from the `uses` list of '{service}'")
    )]
    MissingDependency { service: String, missing: String },

    #[error("Service not found: {0}")]
    #[diagnostic(code(stackup::service::not_found))]
    ServiceNotFound(String),

    #[error("Port {port} is in use{}",
        .process_name.as_ref()
            .zip(.pid.as_ref())
            .map(|(name, pid)| format!(" by process '{}' (PID {})", name, pid))
            .unwrap_or_default()
    )]
    #[diagnostic(
        code(stackup::port::conflict),
        help("Stop the process holding the port, pick another port, or run with `--port-policy auto-reassign`")
    )]
    PortConflict {
        port: u16,
        pid: Option<u32>,
        process_name: Option<String>,
    },

    #[error("No available ports in range {start}-{end}")]
    #[diagnostic(
        code(stackup::port::exhausted),
        help("Widen the range with STACKUP_PORT_RANGE_START / STACKUP_PORT_RANGE_END")
    )]
    PortExhausted { start: u16, end: u16 },

    #[error("Invalid port {port}: {reason}")]
    InvalidPort { port: u32, reason: String },

    #[error("Failed to terminate process {pid}: {reason}")]
    #[diagnostic(
        code(stackup::port::kill_failed),
        help("The process may belong to another user or be protected. Stop it manually and retry")
    )]
    KillFailure { pid: u32, reason: String },

    #[error("Service '{0}' failed to start: {1}")]
    #[diagnostic(
        code(stackup::service::spawn_failed),
        help("Verify the command exists and is executable")
    )]
    ProcessSpawn(String, String),

    #[error("Service '{service}' did not become healthy: {detail}")]
    #[diagnostic(
        code(stackup::health::timeout),
        help("Check the service logs, or raise `startup_timeout` if the service is slow to boot")
    )]
    HealthTimeout { service: String, detail: String },

    #[error("Operation cancelled for service '{0}'")]
    Cancelled(String),

    #[error("{operation} of '{service}' failed: {reason}")]
    OperationFailed {
        service: String,
        operation: String,
        reason: String,
    },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),

    #[error("{0}")]
    #[diagnostic(code(stackup::startup::failed))]
    Startup(Box<StartupReport>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::CircularDependency(services) => Some(format!(
                "Break the cycle by removing one of the `uses` edges between: {}",
                services.join(", ")
            )),
            Error::MissingDependency { service, missing } => Some(format!(
                "Declare '{}' or drop it from the `uses` list of '{}'.",
                missing, service
            )),
            Error::PortConflict {
                port,
                pid,
                process_name,
            } => {
                let kill_hint = match (pid, process_name) {
                    (Some(p), Some(name)) => {
                        format!("Stop '{}' (PID {}) or choose a different port.", name, p)
                    }
                    (Some(p), None) => format!("Kill PID {} or choose a different port.", p),
                    _ => "Choose a different port or let stackup reassign one.".to_string(),
                };
                Some(format!("Port {} is already in use. {}", port, kill_hint))
            }
            Error::PortExhausted { start, end } => Some(format!(
                "Every port between {} and {} is taken. Stop unused services or widen the range.",
                start, end
            )),
            Error::KillFailure { pid, .. } => Some(format!(
                "Try stopping PID {} manually (it may need elevated permissions).",
                pid
            )),
            Error::HealthTimeout { service, .. } => Some(format!(
                "Inspect the logs of '{}' and verify its health check settings.",
                service
            )),
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your stack file with: stackup plan".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// Whether a spawn failed because its port was taken by the time the
    /// service tried to bind it.
    pub fn is_address_in_use(&self) -> bool {
        let message = match self {
            Error::Io(e) if e.kind() == io::ErrorKind::AddrInUse => return true,
            Error::Io(e) => e.to_string(),
            Error::ProcessSpawn(_, reason) => reason.clone(),
            _ => return false,
        };
        let message = message.to_ascii_lowercase();
        ["address already in use", "address in use", "eaddrinuse"]
            .iter()
            .any(|needle| message.contains(needle))
    }

    /// The startup report carried by a failed run, if this is one.
    pub fn startup_report(&self) -> Option<&StartupReport> {
        match self {
            Error::Startup(report) => Some(report),
            _ => None,
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
#[cfg(unix)]
pub fn validate_pid(pid: u32, context: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for '{}' (refers to process group, not a process)",
                context
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("refusing to signal PID 1 (init) for '{}'", context),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("PID exceeds i32::MAX for '{}'", context),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1 for read-only existence checks.
#[cfg(unix)]
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}
