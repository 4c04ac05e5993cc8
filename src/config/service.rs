use super::{HealthCheck, HealthCheckSpec, default_check_type};
use crate::error::{Error, Result};
use crate::service::{LaunchSpec, ServiceMode, ServiceType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One service as declared in the stack file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Services that must be ready before this one starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,
    /// Declared ports; the first one is requested from the port manager
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ServiceMode>,
}

impl ServiceDefinition {
    /// Declared type, or inferred: containers when an image is set,
    /// `http` when ports are declared, `process` otherwise.
    pub fn service_type(&self) -> ServiceType {
        if let Some(t) = self.service_type {
            return t;
        }
        if self.image.is_some() && self.command.is_none() {
            return ServiceType::Container;
        }
        if self.ports.is_empty() {
            ServiceType::Process
        } else {
            ServiceType::Http
        }
    }

    /// Run mode. Only process services honour a configured mode.
    pub fn mode(&self) -> ServiceMode {
        match self.service_type() {
            ServiceType::Process => self.mode.unwrap_or_default(),
            _ => ServiceMode::Daemon,
        }
    }

    /// Port requested from the port manager, 0 when none is declared.
    pub fn requested_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or(0)
    }

    /// Resolved health check, `None` when checking is disabled.
    pub fn health_check(&self) -> Result<Option<HealthCheckSpec>> {
        let service_type = self.service_type();
        match &self.health {
            Some(hc) => hc.resolve(service_type),
            None => HealthCheckSpec::for_type(default_check_type(service_type)).map(Some),
        }
    }

    pub fn health_enabled(&self) -> bool {
        !self.health.as_ref().is_some_and(HealthCheck::is_disabled)
    }

    /// Launch specification for this service with the resolved port.
    pub fn launch_spec(&self, name: &str, port: u16) -> LaunchSpec {
        LaunchSpec {
            service: name.to_string(),
            command: self.command.clone(),
            image: self.image.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            port,
            mode: self.mode(),
        }
    }

    pub(super) fn validate(&self, name: &str) -> Result<()> {
        if self.command.is_none() && self.image.is_none() {
            return Err(Error::Validation(format!(
                "service '{}' needs either a command or an image",
                name
            )));
        }
        if self.ports.contains(&0) {
            return Err(Error::Validation(format!(
                "service '{}' declares port 0; omit the port instead",
                name
            )));
        }
        if self.uses.iter().any(|dep| dep == name) {
            return Err(Error::Validation(format!(
                "service '{}' cannot use itself",
                name
            )));
        }
        if self.mode.is_some() && self.service_type() != ServiceType::Process {
            return Err(Error::Validation(format!(
                "service '{}' sets a mode, which only applies to process services",
                name
            )));
        }
        self.health_check().map_err(|e| {
            Error::Validation(format!("service '{}': {}", name, e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckTarget;

    fn service(yaml: &str) -> ServiceDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_type_inference() {
        assert_eq!(
            service("command: ./api\nports: [3000]").service_type(),
            ServiceType::Http
        );
        assert_eq!(
            service("command: ./worker").service_type(),
            ServiceType::Process
        );
        assert_eq!(
            service("image: postgres:16\nports: [5432]").service_type(),
            ServiceType::Container
        );
        assert_eq!(
            service("command: pg\ntype: tcp\nports: [5432]").service_type(),
            ServiceType::Tcp
        );
    }

    #[test]
    fn test_mode_only_for_process_services() {
        assert_eq!(
            service("command: make\nmode: build").mode(),
            ServiceMode::Build
        );
        assert_eq!(
            service("command: ./api\nports: [3000]").mode(),
            ServiceMode::Daemon
        );
        assert!(service("command: ./api\nports: [3000]\nmode: build")
            .validate("api")
            .is_err());
    }

    #[test]
    fn test_default_health_follows_type() {
        let spec = service("command: ./api\nports: [3000]")
            .health_check()
            .unwrap()
            .unwrap();
        assert_eq!(
            spec.target,
            CheckTarget::Http {
                path: "/health".into(),
                discover: true,
            }
        );

        let disabled = service("command: ./api\nhealth: disabled");
        assert!(!disabled.health_enabled());
        assert!(disabled.health_check().unwrap().is_none());
    }

    #[test]
    fn test_validation_errors() {
        assert!(service("ports: [3000]").validate("x").is_err());
        assert!(service("command: a\nuses: [x]").validate("x").is_err());
        assert!(service("command: a\nhealth: sometimes").validate("x").is_err());
        assert!(service("command: a\nuses: [db]").validate("x").is_ok());
    }

    #[test]
    fn test_launch_spec_carries_port_and_mode() {
        let def = service("command: make\nmode: task\nenv: {A: b}");
        let spec = def.launch_spec("build", 0);
        assert_eq!(spec.service, "build");
        assert_eq!(spec.mode, ServiceMode::Task);
        assert_eq!(spec.env.get("A").map(String::as_str), Some("b"));
        assert_eq!(spec.port, 0);
    }
}
