//! Shared, lock-protected record of every service the orchestrator knows about.
//!
//! The orchestrator writes lifecycle fields (status, handle, port, exit info)
//! and the health monitor writes the health field. Readers always receive
//! clones; the map itself is never exposed.

use crate::error::{Error, Result};
use crate::healthcheck::HealthState;
use crate::service::{ServiceHandle, ServiceMode, ServiceType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceStatus {
    /// Statuses that begin a new run and therefore reset health.
    fn begins_run(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub status: ServiceStatus,
    pub health: HealthState,
    /// Last health check detail ("connection refused", "HTTP 503", ...)
    pub health_detail: Option<String>,
    /// False when health checking is disabled; health then stays `unknown`
    pub health_enabled: bool,
    pub service_type: ServiceType,
    pub mode: ServiceMode,
    pub handle: Option<ServiceHandle>,
    /// Assigned port, 0 if none
    pub port: u16,
    pub url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl RegistryEntry {
    /// Fresh entry in `starting` state, created before any process exists.
    pub fn new(name: impl Into<String>, service_type: ServiceType, mode: ServiceMode) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Starting,
            health: HealthState::Starting,
            health_detail: None,
            health_enabled: true,
            service_type,
            mode,
            handle: None,
            port: 0,
            url: None,
            start_time: Some(Utc::now()),
            last_checked: None,
            end_time: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self.url = url_for(self.service_type, port);
        self
    }

    pub fn with_health_enabled(mut self, enabled: bool) -> Self {
        self.health_enabled = enabled;
        self.health = if enabled {
            HealthState::Starting
        } else {
            HealthState::Unknown
        };
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthState::Healthy
    }
}

fn url_for(service_type: ServiceType, port: u16) -> Option<String> {
    (port > 0 && service_type == ServiceType::Http).then(|| format!("http://localhost:{}", port))
}

/// Owned registry object. Create one per orchestrator and share it via `Arc`.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry.
    ///
    /// When an entry already exists its `type` and `mode` are kept: they are
    /// launch-time facts of the first registration.
    pub fn upsert(&self, mut entry: RegistryEntry) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&entry.name) {
            entry.service_type = existing.service_type;
            entry.mode = existing.mode;
        }
        entries.insert(entry.name.clone(), entry);
    }

    /// Update lifecycle fields. `None` leaves handle or port unchanged.
    ///
    /// Moving into `starting` or `running` from a different status resets
    /// health to `starting` (or `unknown` when checking is disabled).
    pub fn update_status(
        &self,
        service: &str,
        status: ServiceStatus,
        handle: Option<ServiceHandle>,
        port: Option<u16>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;

        if entry.status != status && status.begins_run() {
            entry.health = if entry.health_enabled {
                HealthState::Starting
            } else {
                HealthState::Unknown
            };
            entry.health_detail = None;
            if status == ServiceStatus::Starting || entry.start_time.is_none() {
                entry.start_time = Some(Utc::now());
            }
            entry.end_time = None;
            entry.exit_code = None;
            entry.error = None;
        }
        if matches!(status, ServiceStatus::Stopped | ServiceStatus::Error) {
            entry.end_time = Some(Utc::now());
        }

        entry.status = status;
        if let Some(handle) = handle {
            entry.handle = Some(handle);
        }
        if let Some(port) = port {
            entry.port = port;
            entry.url = url_for(entry.service_type, port);
        }
        Ok(())
    }

    /// Record a failure message alongside an `error` status.
    pub fn mark_error(&self, service: &str, message: impl Into<String>) -> Result<()> {
        self.update_status(service, ServiceStatus::Error, None, None)?;
        if let Some(entry) = self.entries.write().get_mut(service) {
            entry.error = Some(message.into());
        }
        Ok(())
    }

    /// Update the health field only.
    pub fn update_health(
        &self,
        service: &str,
        health: HealthState,
        detail: Option<String>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;
        entry.health = health;
        entry.health_detail = detail;
        entry.last_checked = Some(Utc::now());
        Ok(())
    }

    /// Record how a process ended.
    pub fn update_exit_info(&self, service: &str, exit_code: i32) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;
        entry.exit_code = Some(exit_code);
        entry.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn get(&self, service: &str) -> Option<RegistryEntry> {
        self.entries.read().get(service).cloned()
    }

    /// Snapshot of all entries, sorted by name.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Delete an entry. Only used when a service is no longer declared.
    pub fn remove(&self, service: &str) -> Option<RegistryEntry> {
        self.entries.write().remove(service)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.entries.read().contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(name: &str) -> RegistryEntry {
        RegistryEntry::new(name, ServiceType::Http, ServiceMode::Daemon).with_port(3000)
    }

    #[test]
    fn test_upsert_and_get_returns_copy() {
        let registry = Registry::new();
        registry.upsert(entry("api"));

        let mut copy = registry.get("api").unwrap();
        copy.port = 9999;
        assert_eq!(registry.get("api").unwrap().port, 3000);
        assert_eq!(
            registry.get("api").unwrap().url.as_deref(),
            Some("http://localhost:3000")
        );
    }

    #[test]
    fn test_upsert_preserves_type_and_mode() {
        let registry = Registry::new();
        registry.upsert(RegistryEntry::new("job", ServiceType::Process, ServiceMode::Build));
        registry.upsert(RegistryEntry::new("job", ServiceType::Http, ServiceMode::Daemon));

        let stored = registry.get("job").unwrap();
        assert_eq!(stored.service_type, ServiceType::Process);
        assert_eq!(stored.mode, ServiceMode::Build);
    }

    #[test]
    fn test_status_transition_resets_health() {
        let registry = Registry::new();
        registry.upsert(entry("api"));
        registry
            .update_health("api", HealthState::Healthy, None)
            .unwrap();

        registry
            .update_status("api", ServiceStatus::Stopped, None, None)
            .unwrap();
        assert_eq!(registry.get("api").unwrap().health, HealthState::Healthy);

        let handle = ServiceHandle::process("api", 1234);
        registry
            .update_status("api", ServiceStatus::Running, Some(handle.clone()), Some(3001))
            .unwrap();
        let stored = registry.get("api").unwrap();
        assert_eq!(stored.health, HealthState::Starting);
        assert_eq!(stored.handle, Some(handle));
        assert_eq!(stored.port, 3001);
        assert_eq!(stored.service_type, ServiceType::Http);

        // Same status again leaves health alone
        registry
            .update_health("api", HealthState::Healthy, None)
            .unwrap();
        registry
            .update_status("api", ServiceStatus::Running, None, None)
            .unwrap();
        assert_eq!(registry.get("api").unwrap().health, HealthState::Healthy);
    }

    #[test]
    fn test_disabled_health_stays_unknown() {
        let registry = Registry::new();
        registry.upsert(entry("worker").with_health_enabled(false));
        registry
            .update_status("worker", ServiceStatus::Running, None, None)
            .unwrap();
        assert_eq!(registry.get("worker").unwrap().health, HealthState::Unknown);
    }

    #[test]
    fn test_stop_keeps_entry() {
        let registry = Registry::new();
        registry.upsert(entry("api"));
        registry
            .update_status("api", ServiceStatus::Stopped, None, None)
            .unwrap();
        registry.update_exit_info("api", 143).unwrap();

        let stored = registry.get("api").unwrap();
        assert_eq!(stored.status, ServiceStatus::Stopped);
        assert_eq!(stored.exit_code, Some(143));
        assert!(stored.end_time.is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("api").is_some());
        assert!(registry.get("api").is_none());
    }

    #[test]
    fn test_unknown_service_errors() {
        let registry = Registry::new();
        assert!(matches!(
            registry.update_status("ghost", ServiceStatus::Running, None, None),
            Err(Error::ServiceNotFound(_))
        ));
        assert!(registry
            .update_health("ghost", HealthState::Healthy, None)
            .is_err());
    }

    #[test]
    fn test_mark_error_records_message() {
        let registry = Registry::new();
        registry.upsert(entry("api"));
        registry.mark_error("api", "exit 1").unwrap();
        let stored = registry.get("api").unwrap();
        assert_eq!(stored.status, ServiceStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("exit 1"));
    }

    #[test]
    fn test_list_sorted_under_concurrent_writers() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.upsert(RegistryEntry::new(
                        format!("svc-{}", i),
                        ServiceType::Process,
                        ServiceMode::Daemon,
                    ));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let names: Vec<String> = registry.list().into_iter().map(|e| e.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 8);
    }
}
