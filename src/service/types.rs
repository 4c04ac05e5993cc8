use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// What kind of endpoint a service exposes.
///
/// Determines the default health check: `http` services get an HTTP check,
/// `tcp` services a connect check, and everything else a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Http,
    Tcp,
    Process,
    Container,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Http => write!(f, "http"),
            ServiceType::Tcp => write!(f, "tcp"),
            ServiceType::Process => write!(f, "process"),
            ServiceType::Container => write!(f, "container"),
        }
    }
}

/// How a process-type service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Continuous process that rebuilds on file changes
    Watch,
    /// One-shot build that exits when done
    Build,
    /// Long-running background process
    #[default]
    Daemon,
    /// One-shot task run on demand
    Task,
}

impl ServiceMode {
    /// Build and task services are expected to exit; a clean exit is success.
    pub fn runs_to_completion(&self) -> bool {
        matches!(self, ServiceMode::Build | ServiceMode::Task)
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceMode::Watch => write!(f, "watch"),
            ServiceMode::Build => write!(f, "build"),
            ServiceMode::Daemon => write!(f, "daemon"),
            ServiceMode::Task => write!(f, "task"),
        }
    }
}

/// Identifier of a running process or container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleId {
    Pid(u32),
    Container(String),
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleId::Pid(pid) => write!(f, "pid:{}", pid),
            HandleId::Container(id) => {
                let short = id.get(..12).unwrap_or(id.as_str());
                write!(f, "container:{}", short)
            }
        }
    }
}

/// Handle returned by an [`Executor`](super::Executor) for a started service.
///
/// Only the orchestrator holds handles it can act on; the registry stores a
/// copy purely for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub service: String,
    pub id: HandleId,
    pub started_at: DateTime<Utc>,
}

impl ServiceHandle {
    pub fn process(service: impl Into<String>, pid: u32) -> Self {
        Self {
            service: service.into(),
            id: HandleId::Pid(pid),
            started_at: Utc::now(),
        }
    }

    pub fn container(service: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            id: HandleId::Container(id.into()),
            started_at: Utc::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.id {
            HandleId::Pid(pid) => Some(pid),
            HandleId::Container(_) => None,
        }
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.service, self.id)
    }
}

/// Everything an executor needs to launch one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub service: String,
    /// Shell command for process services
    pub command: Option<String>,
    /// Image reference for container services
    pub image: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Resolved port, 0 when the service has none
    pub port: u16,
    pub mode: ServiceMode,
}

impl LaunchSpec {
    /// Environment with `PORT` injected when a port was resolved.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if self.port > 0 {
            env.entry("PORT".to_string())
                .or_insert_with(|| self.port.to_string());
        }
        env
    }
}
