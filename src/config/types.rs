use super::{resolve_duration, ServiceDefinition};
use crate::error::{Error, Result};
use crate::port::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default time a level waits for its services to become ready (2 minutes)
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default grace period between a graceful stop signal and a forced kill
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Stack-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub port_policy: ConflictPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout: Option<String>,
    /// Stop services from completed levels when a later level fails
    #[serde(default)]
    pub rollback_on_failure: bool,
}

impl Settings {
    pub fn startup_timeout(&self) -> Result<Duration> {
        resolve_duration(
            "settings.startup_timeout",
            self.startup_timeout.as_deref(),
            DEFAULT_STARTUP_TIMEOUT,
        )
    }

    pub fn stop_timeout(&self) -> Result<Duration> {
        resolve_duration(
            "settings.stop_timeout",
            self.stop_timeout.as_deref(),
            DEFAULT_STOP_TIMEOUT,
        )
    }
}

/// A parsed stack file: the service map plus settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default)]
    pub settings: Settings,
}

impl StackConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: StackConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Service name → dependency list, the input of the graph builder.
    pub fn dependency_map(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .iter()
            .map(|(name, def)| (name.clone(), def.uses.clone()))
            .collect()
    }

    /// Structural validation. Dependency references and cycles are checked
    /// by the graph builder so they surface as graph errors.
    pub fn validate(&self) -> Result<()> {
        for (name, def) in &self.services {
            if name.trim().is_empty() {
                return Err(Error::Validation("service names cannot be empty".to_string()));
            }
            def.validate(name)?;
        }

        let mut claimed: BTreeMap<u16, &str> = BTreeMap::new();
        for (name, def) in &self.services {
            if let Some(port) = def.ports.first() {
                if let Some(other) = claimed.insert(*port, name) {
                    return Err(Error::Validation(format!(
                        "services '{}' and '{}' both request port {}",
                        other, name, port
                    )));
                }
            }
        }

        self.settings.startup_timeout()?;
        self.settings.stop_timeout()?;
        Ok(())
    }
}

/// Load and validate a stack file from disk.
pub fn load_config(path: &Path) -> Result<StackConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Could not read {}: {}", path.display(), e))
    })?;
    StackConfig::from_yaml(&content)
}
