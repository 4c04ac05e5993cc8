use crate::error::Error;
use crate::healthcheck::HealthState;
use std::fmt;
use std::time::Duration;

/// Why one service in the failed level is not ready.
#[derive(Debug)]
pub struct ServiceFailure {
    pub service: String,
    pub error: Error,
    /// Health state when the failure was recorded
    pub last_health: Option<HealthState>,
}

/// A service from a later level that was never spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct NotStarted {
    pub service: String,
    /// Failed services it (transitively) depends on. When it depends on none
    /// of them this lists every failure of the level that stopped the run.
    pub blocked_by: Vec<String>,
}

/// Itemized outcome of a leveled startup.
///
/// Returned as-is on success and boxed inside [`Error::Startup`] on failure.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub levels: Vec<Vec<String>>,
    /// Services that passed their readiness gate, in start order
    pub ready: Vec<String>,
    /// Spawned but never ready: left running in an intermediate state
    pub pending: Vec<String>,
    pub failures: Vec<ServiceFailure>,
    pub not_started: Vec<NotStarted>,
    /// Index of the level that failed
    pub failed_level: Option<usize>,
    /// Services stopped again by rollback
    pub rolled_back: Vec<String>,
    pub elapsed: Duration,
}

impl StartupReport {
    pub fn new(levels: Vec<Vec<String>>) -> Self {
        Self {
            levels,
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed_level.is_none() && self.failures.is_empty()
    }

    pub fn failed_services(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.service.as_str()).collect()
    }

    pub fn failure(&self, service: &str) -> Option<&ServiceFailure> {
        self.failures.iter().find(|f| f.service == service)
    }

    pub fn not_started(&self, service: &str) -> Option<&NotStarted> {
        self.not_started.iter().find(|n| n.service == service)
    }
}

impl fmt::Display for StartupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed_level {
            Some(level) => writeln!(
                f,
                "Startup failed at level {} of {} after {:.1}s",
                level + 1,
                self.levels.len(),
                self.elapsed.as_secs_f64()
            )?,
            None => writeln!(
                f,
                "Started {} service(s) in {} level(s) in {:.1}s",
                self.ready.len(),
                self.levels.len(),
                self.elapsed.as_secs_f64()
            )?,
        }

        if !self.ready.is_empty() {
            writeln!(f, "  ready: {}", self.ready.join(", "))?;
        }
        if !self.pending.is_empty() {
            writeln!(f, "  not ready: {}", self.pending.join(", "))?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "  failed:")?;
            for failure in &self.failures {
                write!(f, "    - {}: {}", failure.service, failure.error)?;
                match failure.last_health {
                    Some(state) if state != HealthState::Unknown => {
                        writeln!(f, " (health: {})", state)?
                    }
                    _ => writeln!(f)?,
                }
            }
        }
        if !self.not_started.is_empty() {
            writeln!(f, "  not started:")?;
            for skipped in &self.not_started {
                writeln!(
                    f,
                    "    - {} (blocked by {})",
                    skipped.service,
                    skipped.blocked_by.join(", ")
                )?;
            }
        }
        if !self.rolled_back.is_empty() {
            writeln!(f, "  rolled back: {}", self.rolled_back.join(", "))?;
        }
        Ok(())
    }
}
