//! Port assignment and conflict resolution.
//!
//! [`PortManager::assign_port`] is the single entry point the orchestrator
//! uses before spawning a service. It serializes its own decisions behind an
//! async mutex, but the "is it free" check and the service's eventual bind
//! are separate OS operations: another process can take the port in
//! between. The orchestrator therefore holds a [`PortReservation`] until
//! just before the spawn and treats both a failed reservation and an
//! address-in-use spawn error as retryable: it asks for a port again and
//! respawns, a bounded number of times, before reporting the conflict.

use super::{
    default_controller, is_port_available, kill_process_tree, ConflictDecision, ConflictPrompt,
    MemoryPortStore, MemoryPreferenceStore, PortConflict, PortStore, PreferenceStore,
    ProcessController, ProcessInfo, StoredAssignment, TerminalPrompt, ALWAYS_KILL_KEY,
    KILL_GRACE_PERIOD,
};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::TcpListener;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on candidates tried by a reassignment scan
pub const MAX_SCAN_ATTEMPTS: u32 = 100;

/// How long to keep retrying a bind after killing a port's owner
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Assignments unused for this long are dropped by [`PortManager::clean_stale`]
pub const STALE_ASSIGNMENT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const PORT_RANGE_START_ENV: &str = "STACKUP_PORT_RANGE_START";
pub const PORT_RANGE_END_ENV: &str = "STACKUP_PORT_RANGE_END";

/// What to do when a requested port is already bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Ask the user (kill, reassign or cancel)
    #[default]
    Prompt,
    /// Kill the owning process tree without asking
    AlwaysKill,
    /// Pick another free port, never kill
    AutoReassign,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Prompt => write!(f, "prompt"),
            ConflictPolicy::AlwaysKill => write!(f, "always-kill"),
            ConflictPolicy::AutoReassign => write!(f, "auto-reassign"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt" => Ok(ConflictPolicy::Prompt),
            "always-kill" | "kill" => Ok(ConflictPolicy::AlwaysKill),
            "auto-reassign" | "reassign" => Ok(ConflictPolicy::AutoReassign),
            other => Err(Error::Config(format!(
                "Unknown port policy '{}' (expected prompt, always-kill or auto-reassign)",
                other
            ))),
        }
    }
}

/// How a port request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    /// The port was free
    None,
    Reassigned,
    /// The previous owner was killed
    Killed,
    /// The conflict is still there; the service must not start
    Unresolved,
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionAction::None => "none",
            ResolutionAction::Reassigned => "reassigned",
            ResolutionAction::Killed => "killed",
            ResolutionAction::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortAssignment {
    pub service: String,
    /// Port asked for (0 means "any")
    pub requested: u16,
    /// Port the service should bind. Equal to `requested` when unresolved.
    pub resolved: u16,
    /// Process that held the requested port, if there was a conflict
    pub owner: Option<ProcessInfo>,
    pub action: ResolutionAction,
}

impl PortAssignment {
    pub fn is_resolved(&self) -> bool {
        self.action != ResolutionAction::Unresolved
    }
}

/// Inclusive range that reassignment scans draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 3000,
            end: 65535,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            return Err(Error::InvalidPort {
                port: 0,
                reason: "port range cannot start at 0".to_string(),
            });
        }
        if start > end {
            return Err(Error::InvalidPort {
                port: start as u32,
                reason: format!("range start is above range end {}", end),
            });
        }
        Ok(Self { start, end })
    }

    /// Read `STACKUP_PORT_RANGE_START` / `STACKUP_PORT_RANGE_END`, falling
    /// back to the default for anything missing or malformed.
    pub fn from_env() -> Self {
        let default = Self::default();
        let read = |key: &str, fallback: u16| match std::env::var(key) {
            Ok(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                tracing::warn!("Ignoring invalid {}={:?}", key, raw);
                fallback
            }),
            Err(_) => fallback,
        };
        let start = read(PORT_RANGE_START_ENV, default.start);
        let end = read(PORT_RANGE_END_ENV, default.end);
        Self::new(start, end).unwrap_or_else(|e| {
            tracing::warn!("Ignoring port range from environment: {}", e);
            default
        })
    }

    /// Number of ports in the range; 0 when `end` is below `start`.
    pub fn len(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        (self.end - self.start) as u32 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Holds a port bound until the service is about to start.
///
/// Binds 127.0.0.1 and, where the platform allows it alongside, 0.0.0.0.
pub struct PortReservation {
    port: u16,
    listeners: Mutex<Vec<TcpListener>>,
}

impl PortReservation {
    pub fn reserve(port: u16) -> Result<Self> {
        let loopback = TcpListener::bind(("127.0.0.1", port)).map_err(|e| Error::InvalidPort {
            port: port as u32,
            reason: format!("cannot reserve: {}", e),
        })?;
        // Port 0 asks the OS to pick one
        let port = loopback.local_addr().map(|addr| addr.port()).unwrap_or(port);
        // On Linux this fails because 127.0.0.1 already covers it, which is fine
        let any = TcpListener::bind(("0.0.0.0", port)).ok();

        let mut listeners = vec![loopback];
        listeners.extend(any);
        Ok(Self {
            port,
            listeners: Mutex::new(listeners),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_held(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    /// Drop the listeners. Returns false when they were already released.
    pub fn release(&self) -> bool {
        let mut listeners = self.listeners.lock();
        let held = !listeners.is_empty();
        listeners.clear();
        held
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation")
            .field("port", &self.port)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Owns every port decision made for the stack.
pub struct PortManager {
    controller: Arc<dyn ProcessController>,
    preferences: Arc<dyn PreferenceStore>,
    store: Arc<dyn PortStore>,
    prompt: Arc<dyn ConflictPrompt>,
    range: PortRange,
    verify_timeout: Duration,
    allocation: tokio::sync::Mutex<()>,
    assignments: RwLock<HashMap<String, PortAssignment>>,
}

impl PortManager {
    /// Manager with in-memory stores and a terminal prompt.
    pub fn new(controller: Arc<dyn ProcessController>) -> Self {
        Self {
            controller,
            preferences: Arc::new(MemoryPreferenceStore::new()),
            store: Arc::new(MemoryPortStore::new()),
            prompt: Arc::new(TerminalPrompt),
            range: PortRange::from_env(),
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            allocation: tokio::sync::Mutex::new(()),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Manager using the controller for the current platform.
    pub fn for_platform() -> Self {
        Self::new(Arc::from(default_controller()))
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PortStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_range(mut self, range: PortRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Point-in-time check; see the module docs.
    pub fn is_port_free(&self, port: u16) -> bool {
        is_port_available(port)
    }

    /// The conflict error for `port`, naming its owner when one is known.
    pub fn conflict_error(&self, port: u16) -> Error {
        match PortConflict::check(port, self.controller.as_ref()) {
            Some(conflict) => conflict.to_error(),
            None => Error::PortConflict {
                port,
                pid: None,
                process_name: None,
            },
        }
    }

    /// Whether the user chose "always kill" at some point.
    pub fn always_kill_preferred(&self) -> bool {
        matches!(
            self.preferences.get_preference(ALWAYS_KILL_KEY).as_deref(),
            Some("true")
        )
    }

    /// Secure a port for `service`.
    ///
    /// A `requested` port of 0 means "any": the service's previously stored
    /// port is reused when it is still free, otherwise the range is scanned.
    /// A reassignment away from a taken port prefers the stored port the
    /// same way, so a moved service keeps its port across runs.
    ///
    /// # Errors
    ///
    /// - [`Error::PortConflict`] when the conflict is left unresolved (cancel,
    ///   non-interactive prompt, or the port belongs to another service)
    /// - [`Error::KillFailure`] when the owner could not be killed or the port
    ///   stayed bound afterwards
    /// - [`Error::PortExhausted`] when no free port was found in the range
    ///
    /// Failed requests are recorded with [`ResolutionAction::Unresolved`].
    pub async fn assign_port(
        &self,
        service: &str,
        requested: u16,
        policy: ConflictPolicy,
    ) -> Result<PortAssignment> {
        let _guard = self.allocation.lock().await;

        let result = if requested == 0 {
            self.assign_any(service).await
        } else {
            self.assign_requested(service, requested, policy).await
        };

        match result {
            Ok(assignment) => {
                tracing::debug!(
                    "Port {} assigned to '{}' (requested {}, action {})",
                    assignment.resolved,
                    service,
                    assignment.requested,
                    assignment.action
                );
                if let Err(e) = self.store.save(StoredAssignment {
                    service: service.to_string(),
                    port: assignment.resolved,
                    last_used: Utc::now(),
                }) {
                    tracing::warn!("Failed to persist port for '{}': {}", service, e);
                }
                self.assignments
                    .write()
                    .insert(service.to_string(), assignment.clone());
                Ok(assignment)
            }
            Err((owner, err)) => {
                self.assignments.write().insert(
                    service.to_string(),
                    PortAssignment {
                        service: service.to_string(),
                        requested,
                        resolved: requested,
                        owner,
                        action: ResolutionAction::Unresolved,
                    },
                );
                Err(err)
            }
        }
    }

    async fn assign_any(
        &self,
        service: &str,
    ) -> std::result::Result<PortAssignment, (Option<ProcessInfo>, Error)> {
        if let Some(stored) = self.store.get(service) {
            let claimed = self.claimed_ports(service);
            if !claimed.contains(&stored.port) && is_port_available(stored.port) {
                return Ok(PortAssignment {
                    service: service.to_string(),
                    requested: 0,
                    resolved: stored.port,
                    owner: None,
                    action: ResolutionAction::None,
                });
            }
            tracing::debug!(
                "Stored port {} for '{}' is no longer free, scanning",
                stored.port,
                service
            );
        }
        let port = self.scan(service, None).map_err(|e| (None, e))?;
        Ok(PortAssignment {
            service: service.to_string(),
            requested: 0,
            resolved: port,
            owner: None,
            action: ResolutionAction::None,
        })
    }

    async fn assign_requested(
        &self,
        service: &str,
        requested: u16,
        policy: ConflictPolicy,
    ) -> std::result::Result<PortAssignment, (Option<ProcessInfo>, Error)> {
        if let Some(other) = self.claimant(requested, service) {
            // Never kill a port we handed to another service
            if policy == ConflictPolicy::AutoReassign {
                return self.reassign(service, requested, None);
            }
            let err = Error::OperationFailed {
                service: service.to_string(),
                operation: "assign port".to_string(),
                reason: format!("port {} is already assigned to '{}'", requested, other),
            };
            return Err((None, err));
        }

        let Some(conflict) = PortConflict::check(requested, self.controller.as_ref()) else {
            return Ok(PortAssignment {
                service: service.to_string(),
                requested,
                resolved: requested,
                owner: None,
                action: ResolutionAction::None,
            });
        };

        let owner = conflict.owner().cloned();
        tracing::info!(
            "Port {} requested by '{}' is in use{}",
            requested,
            service,
            conflict.owner_description()
        );

        let policy = match policy {
            ConflictPolicy::Prompt if self.always_kill_preferred() => ConflictPolicy::AlwaysKill,
            other => other,
        };

        match policy {
            ConflictPolicy::AutoReassign => self.reassign(service, requested, owner),
            ConflictPolicy::AlwaysKill => self.kill_and_verify(service, &conflict).await,
            ConflictPolicy::Prompt => match self.ask(service, &conflict).await {
                Some(ConflictDecision::Kill) => self.kill_and_verify(service, &conflict).await,
                Some(ConflictDecision::AlwaysKill) => {
                    if let Err(e) = self.preferences.set_preference(ALWAYS_KILL_KEY, "true") {
                        tracing::warn!("Failed to save always-kill preference: {}", e);
                    }
                    self.kill_and_verify(service, &conflict).await
                }
                Some(ConflictDecision::Reassign) => self.reassign(service, requested, owner),
                Some(ConflictDecision::Cancel) | None => Err((owner, conflict.to_error())),
            },
        }
    }

    fn reassign(
        &self,
        service: &str,
        requested: u16,
        owner: Option<ProcessInfo>,
    ) -> std::result::Result<PortAssignment, (Option<ProcessInfo>, Error)> {
        let stored = self.store.get(service).map(|stored| stored.port).filter(|port| {
            *port != 0
                && *port != requested
                && !self.claimed_ports(service).contains(port)
                && is_port_available(*port)
        });
        match stored.map(Ok).unwrap_or_else(|| self.scan(service, Some(requested))) {
            Ok(port) => {
                tracing::info!("Reassigned '{}' from port {} to {}", service, requested, port);
                Ok(PortAssignment {
                    service: service.to_string(),
                    requested,
                    resolved: port,
                    owner,
                    action: ResolutionAction::Reassigned,
                })
            }
            Err(e) => Err((owner, e)),
        }
    }

    async fn kill_and_verify(
        &self,
        service: &str,
        conflict: &PortConflict,
    ) -> std::result::Result<PortAssignment, (Option<ProcessInfo>, Error)> {
        let owner = conflict.owner().cloned();
        let Some(first) = owner.clone() else {
            let err = Error::KillFailure {
                pid: 0,
                reason: format!("could not identify the process holding port {}", conflict.port),
            };
            return Err((None, err));
        };

        for process in &conflict.processes {
            tracing::info!(
                "Killing {} (PID {}) to free port {} for '{}'",
                process.name,
                process.pid,
                conflict.port,
                service
            );
            if let Err(e) =
                kill_process_tree(self.controller.as_ref(), process.pid, KILL_GRACE_PERIOD).await
            {
                return Err((owner, e));
            }
        }

        if !self.wait_until_free(conflict.port).await {
            let err = Error::KillFailure {
                pid: first.pid,
                reason: format!(
                    "port {} still in use {}ms after the owner was killed",
                    conflict.port,
                    self.verify_timeout.as_millis()
                ),
            };
            return Err((owner, err));
        }

        Ok(PortAssignment {
            service: service.to_string(),
            requested: conflict.port,
            resolved: conflict.port,
            owner,
            action: ResolutionAction::Killed,
        })
    }

    /// Retry a bind with backoff until it succeeds or the verify window ends.
    async fn wait_until_free(&self, port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + self.verify_timeout;
        let mut delay = Duration::from_millis(50);
        loop {
            if is_port_available(port) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_secs(1));
        }
    }

    async fn ask(&self, service: &str, conflict: &PortConflict) -> Option<ConflictDecision> {
        let prompt = Arc::clone(&self.prompt);
        let service = service.to_string();
        let conflict = conflict.clone();
        match tokio::task::spawn_blocking(move || prompt.ask(&service, &conflict)).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("Port conflict prompt failed: {}", e);
                None
            }
        }
    }

    /// Ports held by other services, live or stored.
    fn claimed_ports(&self, service: &str) -> HashSet<u16> {
        let mut claimed: HashSet<u16> = self
            .assignments
            .read()
            .values()
            .filter(|a| a.service != service && a.is_resolved())
            .map(|a| a.resolved)
            .collect();
        claimed.extend(
            self.store
                .all()
                .into_iter()
                .filter(|a| a.service != service)
                .map(|a| a.port),
        );
        claimed
    }

    fn claimant(&self, port: u16, service: &str) -> Option<String> {
        self.assignments
            .read()
            .values()
            .find(|a| a.service != service && a.is_resolved() && a.resolved == port)
            .map(|a| a.service.clone())
    }

    /// Random-offset scan over the range for a free, unclaimed port.
    fn scan(&self, service: &str, skip: Option<u16>) -> Result<u16> {
        let span = self.range.len();
        if span == 0 {
            return Err(Error::PortExhausted {
                start: self.range.start,
                end: self.range.end,
            });
        }
        let claimed = self.claimed_ports(service);
        let offset = rand::thread_rng().gen_range(0..span);

        for i in 0..MAX_SCAN_ATTEMPTS.min(span) {
            let port = (self.range.start as u32 + (offset + i) % span) as u16;
            if Some(port) == skip || claimed.contains(&port) {
                continue;
            }
            if is_port_available(port) {
                return Ok(port);
            }
        }

        Err(Error::PortExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Forget the service's assignment, live and stored.
    pub fn release(&self, service: &str) -> Result<Option<PortAssignment>> {
        let removed = self.assignments.write().remove(service);
        self.store.remove(service)?;
        Ok(removed)
    }

    pub fn assignment(&self, service: &str) -> Option<PortAssignment> {
        self.assignments.read().get(service).cloned()
    }

    /// Every assignment made so far, sorted by service name.
    pub fn assignments(&self) -> Vec<PortAssignment> {
        let mut all: Vec<_> = self.assignments.read().values().cloned().collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Stored assignments from earlier runs.
    pub fn stored(&self) -> Vec<StoredAssignment> {
        self.store.all()
    }

    /// Drop stored assignments not used within `max_age`. Returns the
    /// services that were removed.
    pub fn clean_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut removed = Vec::new();
        for stored in self.store.all() {
            // A timestamp in the future counts as fresh
            let stale = match (now - stored.last_used).to_std() {
                Ok(age) => age > max_age,
                Err(_) => false,
            };
            if stale && !self.assignments.read().contains_key(&stored.service) {
                self.store.remove(&stored.service)?;
                removed.push(stored.service);
            }
        }
        if !removed.is_empty() {
            tracing::info!("Removed {} stale port assignment(s)", removed.len());
        }
        Ok(removed)
    }
}
