//! Health check configuration.
//!
//! Accepted forms:
//!
//! ```yaml
//! # Disable checking entirely (service is ready as soon as it spawns)
//! health: disabled
//!
//! # Shorthand selecting the check with default parameters
//! health: tcp
//!
//! # Full form
//! health:
//!   type: http
//!   path: /health
//!   interval: 5s
//!   timeout: 2s
//!   grace_period: 10s
//!   slow_threshold: 800ms
//!   failure_threshold: 2
//!   circuit_breaker:
//!     failures: 5
//!     open_for: 30s
//!
//! # Command checks: a string runs through the shell, a list runs directly
//! health:
//!   type: command
//!   command: pg_isready -h localhost
//! ```
//!
//! An HTTP check without an explicit `path` queries `/health` and falls back
//! to the other common endpoints (`/healthz`, `/ready`, `/alive`, `/ping`)
//! when it answers 404.

use super::resolve_duration;
use crate::error::{Error, Result};
use crate::service::ServiceType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default polling interval between checks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for a single HTTP or process check.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single TCP connect.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(2);

/// Path queried by HTTP checks when none is configured.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Endpoints tried, in order, when no HTTP path is configured.
pub const COMMON_HEALTH_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/alive", "/ping"];

/// Default time an open circuit breaker skips checks.
pub const DEFAULT_BREAKER_OPEN_FOR: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Process,
    Command,
}

impl std::fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthCheckType::Http => write!(f, "http"),
            HealthCheckType::Tcp => write!(f, "tcp"),
            HealthCheckType::Process => write!(f, "process"),
            HealthCheckType::Command => write!(f, "command"),
        }
    }
}

/// Detailed health check settings as written in the stack file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSettings {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<HealthCheckType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Port to check; defaults to the service's resolved port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,
    /// HTTP responses slower than this are reported as degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_threshold: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    /// Command run by `type: command` checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    #[serde(default)]
    pub disabled: bool,
}

/// Command for a command check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Run through `sh -c` (`cmd /C` on Windows)
    Shell(String),
    /// Program and arguments, run without a shell
    Exec(Vec<String>),
}

impl CommandLine {
    fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(command) => command.trim().is_empty(),
            CommandLine::Exec(args) => args.first().map_or(true, |program| program.is_empty()),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Shell(command) => f.write_str(command),
            CommandLine::Exec(args) => f.write_str(&args.join(" ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    /// Consecutive failed checks that open the breaker
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_for: Option<String>,
}

/// Resolved circuit breaker parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerSpec {
    pub failures: u32,
    pub open_for: Duration,
}

/// Health check configuration for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthCheck {
    /// `disabled`, `http`, `tcp` or `process`
    Shorthand(String),
    Detailed(HealthCheckSettings),
}

/// What a resolved check targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    /// `discover` is set when no path was configured
    Http { path: String, discover: bool },
    Tcp,
    Process,
    Command { command: CommandLine },
}

impl CheckTarget {
    pub fn kind(&self) -> HealthCheckType {
        match self {
            CheckTarget::Http { .. } => HealthCheckType::Http,
            CheckTarget::Tcp => HealthCheckType::Tcp,
            CheckTarget::Process => HealthCheckType::Process,
            CheckTarget::Command { .. } => HealthCheckType::Command,
        }
    }
}

/// Fully resolved health check parameters with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckSpec {
    pub target: CheckTarget,
    pub port: Option<u16>,
    pub interval: Duration,
    pub timeout: Duration,
    pub grace_period: Duration,
    pub slow_threshold: Option<Duration>,
    /// Consecutive failures required before an unhealthy verdict
    pub failure_threshold: u32,
    pub circuit_breaker: Option<CircuitBreakerSpec>,
}

impl HealthCheckSpec {
    /// Defaults for a check type.
    ///
    /// # Errors
    ///
    /// Command checks have no default command.
    pub fn for_type(check_type: HealthCheckType) -> Result<Self> {
        let (target, timeout) = match check_type {
            HealthCheckType::Http => (
                CheckTarget::Http {
                    path: DEFAULT_HEALTH_PATH.to_string(),
                    discover: true,
                },
                DEFAULT_HEALTH_TIMEOUT,
            ),
            HealthCheckType::Tcp => (CheckTarget::Tcp, DEFAULT_TCP_TIMEOUT),
            HealthCheckType::Process => (CheckTarget::Process, DEFAULT_HEALTH_TIMEOUT),
            HealthCheckType::Command => {
                return Err(Error::Validation(
                    "command health checks need a `command`".to_string(),
                ))
            }
        };
        Ok(Self::with_target(target, timeout))
    }

    /// Defaults for a command check.
    pub fn command(command: CommandLine) -> Self {
        Self::with_target(CheckTarget::Command { command }, DEFAULT_HEALTH_TIMEOUT)
    }

    fn with_target(target: CheckTarget, timeout: Duration) -> Self {
        Self {
            target,
            port: None,
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout,
            grace_period: Duration::ZERO,
            slow_threshold: None,
            failure_threshold: 1,
            circuit_breaker: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Check implied by a service type when no health check is configured.
pub fn default_check_type(service_type: ServiceType) -> HealthCheckType {
    match service_type {
        ServiceType::Http => HealthCheckType::Http,
        ServiceType::Tcp => HealthCheckType::Tcp,
        ServiceType::Process | ServiceType::Container => HealthCheckType::Process,
    }
}

impl HealthCheck {
    /// Resolve into concrete parameters. `Ok(None)` means checking is disabled.
    pub fn resolve(&self, service_type: ServiceType) -> Result<Option<HealthCheckSpec>> {
        match self {
            HealthCheck::Shorthand(word) => match word.trim().to_ascii_lowercase().as_str() {
                "disabled" | "none" | "off" => Ok(None),
                "http" => HealthCheckSpec::for_type(HealthCheckType::Http).map(Some),
                "tcp" => HealthCheckSpec::for_type(HealthCheckType::Tcp).map(Some),
                "process" => HealthCheckSpec::for_type(HealthCheckType::Process).map(Some),
                "command" => HealthCheckSpec::for_type(HealthCheckType::Command).map(Some),
                other => Err(Error::Validation(format!(
                    "unknown health check '{}' (expected disabled, http, tcp, process or command)",
                    other
                ))),
            },
            HealthCheck::Detailed(settings) => settings.resolve(service_type),
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self {
            HealthCheck::Shorthand(word) => {
                matches!(word.trim().to_ascii_lowercase().as_str(), "disabled" | "none" | "off")
            }
            HealthCheck::Detailed(settings) => settings.disabled,
        }
    }
}

impl HealthCheckSettings {
    fn resolve(&self, service_type: ServiceType) -> Result<Option<HealthCheckSpec>> {
        if self.disabled {
            return Ok(None);
        }

        let check_type = match (self.check_type, &self.command) {
            (Some(check_type), _) => check_type,
            (None, Some(_)) => HealthCheckType::Command,
            (None, None) => default_check_type(service_type),
        };
        let mut spec = match (check_type, &self.command) {
            (HealthCheckType::Command, Some(command)) => {
                if command.is_empty() {
                    return Err(Error::Validation(
                        "health.command cannot be empty".to_string(),
                    ));
                }
                HealthCheckSpec::command(command.clone())
            }
            (HealthCheckType::Command, None) => HealthCheckSpec::for_type(check_type)?,
            (_, Some(_)) => {
                return Err(Error::Validation(format!(
                    "health.command only applies to command checks, not {}",
                    check_type
                )))
            }
            (_, None) => HealthCheckSpec::for_type(check_type)?,
        };

        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(Error::Validation(format!(
                    "health check path '{}' must start with '/'",
                    path
                )));
            }
            match &mut spec.target {
                CheckTarget::Http {
                    path: target,
                    discover,
                } => {
                    *target = path.clone();
                    *discover = false;
                }
                _ => {
                    return Err(Error::Validation(format!(
                        "health check path '{}' only applies to http checks",
                        path
                    )))
                }
            }
        }

        spec.port = self.port;
        spec.interval =
            resolve_duration("health.interval", self.interval.as_deref(), spec.interval)?;
        spec.timeout = resolve_duration("health.timeout", self.timeout.as_deref(), spec.timeout)?;
        spec.grace_period = resolve_duration(
            "health.grace_period",
            self.grace_period.as_deref(),
            spec.grace_period,
        )?;
        spec.slow_threshold = self
            .slow_threshold
            .as_deref()
            .map(|raw| resolve_duration("health.slow_threshold", Some(raw), Duration::ZERO))
            .transpose()?;

        if spec.interval.is_zero() {
            return Err(Error::Validation(
                "health.interval must be greater than zero".to_string(),
            ));
        }
        if let Some(threshold) = self.failure_threshold {
            if threshold == 0 {
                return Err(Error::Validation(
                    "health.failure_threshold must be at least 1".to_string(),
                ));
            }
            spec.failure_threshold = threshold;
        }

        if let Some(breaker) = &self.circuit_breaker {
            if breaker.failures == 0 {
                return Err(Error::Validation(
                    "health.circuit_breaker.failures must be at least 1".to_string(),
                ));
            }
            spec.circuit_breaker = Some(CircuitBreakerSpec {
                failures: breaker.failures,
                open_for: resolve_duration(
                    "health.circuit_breaker.open_for",
                    breaker.open_for.as_deref(),
                    DEFAULT_BREAKER_OPEN_FOR,
                )?,
            });
        }

        Ok(Some(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorthand_disabled() {
        let hc: HealthCheck = serde_yaml::from_str("disabled").unwrap();
        assert!(hc.is_disabled());
        assert_eq!(hc.resolve(ServiceType::Http).unwrap(), None);
    }

    #[test]
    fn test_shorthand_tcp_uses_short_timeout() {
        let hc: HealthCheck = serde_yaml::from_str("tcp").unwrap();
        let spec = hc.resolve(ServiceType::Tcp).unwrap().unwrap();
        assert_eq!(spec.target, CheckTarget::Tcp);
        assert_eq!(spec.timeout, DEFAULT_TCP_TIMEOUT);
        assert_eq!(spec.interval, DEFAULT_HEALTH_INTERVAL);
    }

    #[test]
    fn test_detailed_http() {
        let yaml = r#"
type: http
path: /ready
interval: 1s
timeout: 500ms
grace_period: 10s
slow_threshold: 800ms
failure_threshold: 3
"#;
        let hc: HealthCheck = serde_yaml::from_str(yaml).unwrap();
        let spec = hc.resolve(ServiceType::Http).unwrap().unwrap();
        assert_eq!(
            spec.target,
            CheckTarget::Http {
                path: "/ready".to_string(),
                discover: false,
            }
        );
        assert_eq!(spec.interval, Duration::from_secs(1));
        assert_eq!(spec.timeout, Duration::from_millis(500));
        assert_eq!(spec.grace_period, Duration::from_secs(10));
        assert_eq!(spec.slow_threshold, Some(Duration::from_millis(800)));
        assert_eq!(spec.failure_threshold, 3);
    }

    #[test]
    fn test_detailed_defaults_to_service_type() {
        let hc: HealthCheck = serde_yaml::from_str("interval: 2s").unwrap();
        let spec = hc.resolve(ServiceType::Process).unwrap().unwrap();
        assert_eq!(spec.target, CheckTarget::Process);
        assert_eq!(spec.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_bad_values() {
        let hc: HealthCheck = serde_yaml::from_str("bogus").unwrap();
        assert!(hc.resolve(ServiceType::Http).is_err());

        let hc: HealthCheck = serde_yaml::from_str("path: health").unwrap();
        assert!(hc.resolve(ServiceType::Http).is_err());

        let hc: HealthCheck = serde_yaml::from_str("{type: tcp, path: /x}").unwrap();
        assert!(hc.resolve(ServiceType::Tcp).is_err());

        let hc: HealthCheck = serde_yaml::from_str("interval: 0s").unwrap();
        assert!(hc.resolve(ServiceType::Http).is_err());

        let hc: HealthCheck = serde_yaml::from_str("failure_threshold: 0").unwrap();
        assert!(hc.resolve(ServiceType::Http).is_err());

        let hc: HealthCheck = serde_yaml::from_str("command").unwrap();
        assert!(hc.resolve(ServiceType::Process).is_err());

        let hc: HealthCheck = serde_yaml::from_str(r#"{type: tcp, command: "true"}"#).unwrap();
        assert!(hc.resolve(ServiceType::Tcp).is_err());

        let hc: HealthCheck = serde_yaml::from_str("circuit_breaker: {failures: 0}").unwrap();
        assert!(hc.resolve(ServiceType::Http).is_err());
    }

    #[test]
    fn test_command_forms() {
        let hc: HealthCheck =
            serde_yaml::from_str("command: pg_isready -h localhost").unwrap();
        let spec = hc.resolve(ServiceType::Tcp).unwrap().unwrap();
        assert_eq!(
            spec.target,
            CheckTarget::Command {
                command: CommandLine::Shell("pg_isready -h localhost".into())
            }
        );
        assert_eq!(spec.target.kind(), HealthCheckType::Command);

        let hc: HealthCheck =
            serde_yaml::from_str("{type: command, command: [redis-cli, ping]}").unwrap();
        let spec = hc.resolve(ServiceType::Tcp).unwrap().unwrap();
        assert_eq!(
            spec.target,
            CheckTarget::Command {
                command: CommandLine::Exec(vec!["redis-cli".into(), "ping".into()])
            }
        );
    }

    #[test]
    fn test_default_http_path_discovers() {
        let hc: HealthCheck = serde_yaml::from_str("http").unwrap();
        let spec = hc.resolve(ServiceType::Http).unwrap().unwrap();
        assert_eq!(
            spec.target,
            CheckTarget::Http {
                path: DEFAULT_HEALTH_PATH.to_string(),
                discover: true,
            }
        );
    }

    #[test]
    fn test_circuit_breaker_settings() {
        let hc: HealthCheck =
            serde_yaml::from_str("circuit_breaker: {failures: 4, open_for: 10s}").unwrap();
        let spec = hc.resolve(ServiceType::Http).unwrap().unwrap();
        assert_eq!(
            spec.circuit_breaker,
            Some(CircuitBreakerSpec {
                failures: 4,
                open_for: Duration::from_secs(10),
            })
        );

        let hc: HealthCheck = serde_yaml::from_str("circuit_breaker: {failures: 2}").unwrap();
        let spec = hc.resolve(ServiceType::Http).unwrap().unwrap();
        assert_eq!(
            spec.circuit_breaker.map(|b| b.open_for),
            Some(DEFAULT_BREAKER_OPEN_FOR)
        );
    }
}
