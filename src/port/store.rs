//! Persistence for the port manager: user preferences and per-service port
//! assignments.
//!
//! Both stores come in a JSON-file flavour and an in-memory flavour. The
//! manager only sees the traits.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Preference key of the always-kill setting
pub const ALWAYS_KILL_KEY: &str = "ports.always_kill";

/// Directory (relative to the project) that holds per-project state
pub const STATE_DIR: &str = ".stackup";

/// Key/value user preferences.
pub trait PreferenceStore: Send + Sync {
    fn get_preference(&self, key: &str) -> Option<String>;
    fn set_preference(&self, key: &str, value: &str) -> Result<()>;
}

/// A port previously handed to a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAssignment {
    pub service: String,
    pub port: u16,
    pub last_used: DateTime<Utc>,
}

/// Per-project record of which service got which port.
pub trait PortStore: Send + Sync {
    fn get(&self, service: &str) -> Option<StoredAssignment>;
    fn save(&self, assignment: StoredAssignment) -> Result<()>;
    fn remove(&self, service: &str) -> Result<Option<StoredAssignment>>;
    fn all(&self) -> Vec<StoredAssignment>;
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable state file {}: {}", path.display(), e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Write through a temp file and rename so readers never see a torn file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Preferences stored as a JSON object.
pub struct JsonPreferenceStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = read_json(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// `<config dir>/stackup/preferences.json`
    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not determine the user config directory".into()))?;
        Ok(Self::new(dir.join("stackup").join("preferences.json")))
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get_preference(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        write_json(&self.path, &*values)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_preference(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Assignments stored in `<project>/.stackup/ports.json`.
pub struct JsonPortStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredAssignment>>,
}

impl JsonPortStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_json(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(STATE_DIR).join("ports.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PortStore for JsonPortStore {
    fn get(&self, service: &str) -> Option<StoredAssignment> {
        self.entries.lock().get(service).cloned()
    }

    fn save(&self, assignment: StoredAssignment) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(assignment.service.clone(), assignment);
        write_json(&self.path, &*entries)
    }

    fn remove(&self, service: &str) -> Result<Option<StoredAssignment>> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(service);
        if removed.is_some() {
            write_json(&self.path, &*entries)?;
        }
        Ok(removed)
    }

    fn all(&self) -> Vec<StoredAssignment> {
        self.entries.lock().values().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryPortStore {
    entries: Mutex<BTreeMap<String, StoredAssignment>>,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PortStore for MemoryPortStore {
    fn get(&self, service: &str) -> Option<StoredAssignment> {
        self.entries.lock().get(service).cloned()
    }

    fn save(&self, assignment: StoredAssignment) -> Result<()> {
        self.entries
            .lock()
            .insert(assignment.service.clone(), assignment);
        Ok(())
    }

    fn remove(&self, service: &str) -> Result<Option<StoredAssignment>> {
        Ok(self.entries.lock().remove(service))
    }

    fn all(&self) -> Vec<StoredAssignment> {
        self.entries.lock().values().cloned().collect()
    }
}
