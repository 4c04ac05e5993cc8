use super::{NotStarted, OperationKind, OperationManager, ServiceFailure, StartupReport};
use crate::config::{ServiceDefinition, StackConfig};
use crate::dependency::Graph;
use crate::error::{Error, Result};
use crate::healthcheck::{
    build_checker, CheckContext, HealthMonitor, HealthSnapshot, HealthState, MonitorConfig,
    WatchHandle, WatchOptions,
};
use crate::port::{ConflictPolicy, PortManager, PortReservation};
use crate::registry::{Registry, RegistryEntry, ServiceStatus};
use crate::service::{Executor, ServiceHandle};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How often a readiness gate re-checks that the process is still alive
const LIVENESS_POLL: Duration = Duration::from_millis(500);

/// Spawns tried when the port is taken between assignment and bind
const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Outcome of one spawn attempt that did not fail outright.
enum Launch {
    Started(ServiceHandle, u16),
    /// The port was taken after it was assigned; worth another attempt
    PortLost(Error),
}

/// A single service or the whole stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Service(String),
    All,
}

impl Target {
    pub fn service(name: impl Into<String>) -> Self {
        Target::Service(name.into())
    }
}

/// Brings a stack up level by level and owns every service handle.
///
/// # Concurrency Model
///
/// - All methods take `&self`; state lives behind short-lived locks
/// - Lifecycle operations on one service are serialized by the
///   [`OperationManager`]; concurrent identical requests share one outcome
/// - A [`CancellationToken`] aborts pending readiness waits
///
/// # Lifecycle
///
/// 1. **Plan**: levels from the dependency graph (cycles and missing
///    dependencies are rejected at construction)
/// 2. **Start**: per level, secure ports and spawn every service
///    concurrently, then wait for the whole level to become ready
/// 3. **Stop**: dependents first, graceful signal then forced kill
pub struct Orchestrator {
    config: StackConfig,
    graph: Graph,
    registry: Arc<Registry>,
    monitor: Arc<HealthMonitor>,
    ports: Arc<PortManager>,
    executor: Arc<dyn Executor>,
    operations: OperationManager,
    handles: Mutex<HashMap<String, ServiceHandle>>,
    watches: Mutex<HashMap<String, WatchHandle>>,
    port_policy: ConflictPolicy,
    /// Per-service readiness timeout
    pub startup_timeout: Duration,
    /// Grace period between graceful stop and forced kill
    pub stop_timeout: Duration,
    rollback_on_failure: bool,
    cancellation_token: CancellationToken,
    shutdown_started: AtomicBool,
}

impl Orchestrator {
    /// Validate the dependency graph and set up the components.
    ///
    /// # Errors
    ///
    /// Graph errors ([`Error::MissingDependency`], [`Error::CircularDependency`])
    /// and invalid settings. Nothing has been spawned when this fails.
    pub fn new(
        config: StackConfig,
        executor: Arc<dyn Executor>,
        ports: Arc<PortManager>,
    ) -> Result<Self> {
        let graph = Graph::from_dependencies(&config.dependency_map())?;
        graph.levels()?;

        let registry = Arc::new(Registry::new());
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&registry)));

        Ok(Self {
            port_policy: config.settings.port_policy,
            startup_timeout: config.settings.startup_timeout()?,
            stop_timeout: config.settings.stop_timeout()?,
            rollback_on_failure: config.settings.rollback_on_failure,
            config,
            graph,
            registry,
            monitor,
            ports,
            executor,
            operations: OperationManager::new(),
            handles: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            cancellation_token: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
        })
    }

    pub fn with_port_policy(mut self, policy: ConflictPolicy) -> Self {
        self.port_policy = policy;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }

    /// Replace the health monitor's tuning. Call before starting anything.
    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = Arc::new(HealthMonitor::with_config(
            Arc::clone(&self.registry),
            config,
        ));
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn ports(&self) -> &Arc<PortManager> {
        &self.ports
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn operations(&self) -> &OperationManager {
        &self.operations
    }

    pub fn port_policy(&self) -> ConflictPolicy {
        self.port_policy
    }

    pub fn handle(&self, service: &str) -> Option<ServiceHandle> {
        self.handles.lock().get(service).cloned()
    }

    /// Abort pending readiness waits and prevent further levels.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Start levels for `services` and their dependencies, or for the whole
    /// stack when `services` is empty.
    pub fn plan(&self, services: &[String]) -> Result<Vec<Vec<String>>> {
        if services.is_empty() {
            self.graph.levels()
        } else {
            self.graph.levels_for(services)
        }
    }

    pub async fn start_all(&self) -> Result<StartupReport> {
        let levels = self.plan(&[])?;
        self.start(&levels, self.startup_timeout).await
    }

    /// Start only `services` plus everything they use.
    pub async fn start_services(&self, services: &[String]) -> Result<StartupReport> {
        let levels = self.plan(services)?;
        self.start(&levels, self.startup_timeout).await
    }

    /// Start `levels` in order.
    ///
    /// Every service of a level is spawned concurrently; the next level only
    /// begins once each of them is ready (healthy, or health checking
    /// disabled) within `timeout`. The first level with a failure ends the
    /// run: later levels are never spawned and services from earlier levels
    /// keep running unless rollback is enabled.
    ///
    /// # Errors
    ///
    /// [`Error::Startup`] with the itemized report when a level fails, and
    /// [`Error::Cancelled`] when the run was cancelled.
    pub async fn start(&self, levels: &[Vec<String>], timeout: Duration) -> Result<StartupReport> {
        let started = Instant::now();
        let mut report = StartupReport::new(levels.to_vec());

        for (index, level) in levels.iter().enumerate() {
            if self.is_cancelled() {
                return Err(Error::Cancelled("start".to_string()));
            }
            tracing::info!(
                "Starting level {} of {}: {}",
                index + 1,
                levels.len(),
                level.join(", ")
            );

            let spawns = level.iter().map(|name| self.spawn_guarded(name));
            let spawned = futures::future::join_all(spawns).await;

            let mut failures = Vec::new();
            let mut gated = Vec::new();
            for (name, result) in level.iter().zip(spawned) {
                match result {
                    Ok(()) => gated.push(name.clone()),
                    Err(Error::Cancelled(_)) => {}
                    Err(e) => failures.push(self.failure(name, e)),
                }
            }
            if self.is_cancelled() {
                return Err(Error::Cancelled("start".to_string()));
            }

            let gates = gated.iter().map(|name| self.await_ready(name, timeout));
            let gate_results = futures::future::join_all(gates).await;

            let mut cancelled = false;
            for (name, result) in gated.iter().zip(gate_results) {
                match result {
                    Ok(()) => report.ready.push(name.clone()),
                    Err(Error::Cancelled(_)) => cancelled = true,
                    Err(e) => {
                        report.pending.push(name.clone());
                        failures.push(self.failure(name, e));
                    }
                }
            }
            if cancelled || self.is_cancelled() {
                return Err(Error::Cancelled("start".to_string()));
            }

            if !failures.is_empty() {
                let failed: Vec<String> = failures.iter().map(|f| f.service.clone()).collect();
                tracing::error!(
                    "Level {} failed ({}); not starting later levels",
                    index + 1,
                    failed.join(", ")
                );
                report.failures = failures;
                report.failed_level = Some(index);
                report.not_started = self.blocked(&levels[index + 1..], &failed);
                if self.rollback_on_failure {
                    report.rolled_back = self.rollback(&levels[..index]).await;
                }
                report.elapsed = started.elapsed();
                return Err(Error::Startup(Box::new(report)));
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            "All {} service(s) ready in {:.1}s",
            report.ready.len(),
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    fn failure(&self, service: &str, error: Error) -> ServiceFailure {
        ServiceFailure {
            service: service.to_string(),
            last_health: self.registry.get(service).map(|entry| entry.health),
            error,
        }
    }

    fn blocked(&self, remaining: &[Vec<String>], failed: &[String]) -> Vec<NotStarted> {
        remaining
            .iter()
            .flatten()
            .map(|service| {
                let deps: BTreeSet<String> =
                    self.graph.get_dependencies(service).into_iter().collect();
                let mut blocked_by: Vec<String> =
                    failed.iter().filter(|f| deps.contains(*f)).cloned().collect();
                if blocked_by.is_empty() {
                    blocked_by = failed.to_vec();
                }
                NotStarted {
                    service: service.clone(),
                    blocked_by,
                }
            })
            .collect()
    }

    /// Stop already-started services, latest level first.
    async fn rollback(&self, completed: &[Vec<String>]) -> Vec<String> {
        let mut stopped = Vec::new();
        for level in completed.iter().rev() {
            for service in level.iter().rev() {
                tracing::info!("Rolling back '{}'", service);
                match self.stop_guarded(service).await {
                    Ok(()) => stopped.push(service.clone()),
                    Err(e) => tracing::warn!("Rollback of '{}' failed: {}", service, e),
                }
            }
        }
        stopped
    }

    async fn spawn_guarded(&self, name: &str) -> Result<()> {
        self.operations
            .execute(name, OperationKind::Start, self.spawn_service(name))
            .await
            .into_result()
    }

    async fn spawn_service(&self, name: &str) -> Result<()> {
        self.spawn_service_impl(name)
            .instrument(tracing::info_span!("start_service", service.name = %name))
            .await
    }

    async fn spawn_service_impl(&self, name: &str) -> Result<()> {
        let def = self
            .config
            .services
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

        if self.is_cancelled() {
            return Err(Error::Cancelled(name.to_string()));
        }

        if let Some(handle) = self.handle(name) {
            if self.executor.is_running(&handle).await {
                tracing::debug!("'{}' is already running ({})", name, handle);
                return Ok(());
            }
        }

        let health = def.health_check()?;
        self.registry.upsert(
            RegistryEntry::new(name, def.service_type(), def.mode())
                .with_health_enabled(health.is_some()),
        );

        let mut delay = SPAWN_RETRY_DELAY;
        let mut attempt = 1;
        let (handle, port) = loop {
            let lost = match self.launch(name, def).await {
                Ok(Launch::Started(handle, port)) => break (handle, port),
                Ok(Launch::PortLost(e)) => e,
                Err(e) => {
                    self.record_error(name, &e);
                    return Err(e);
                }
            };
            if attempt >= SPAWN_ATTEMPTS {
                tracing::error!("Failed to start '{}' after {} attempts: {}", name, attempt, lost);
                self.record_error(name, &lost);
                return Err(lost);
            }
            tracing::warn!(
                "Port for '{}' was taken before it could bind ({}), retrying in {}ms",
                name,
                lost,
                delay.as_millis()
            );
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    let err = Error::Cancelled(name.to_string());
                    self.record_error(name, &err);
                    return Err(err);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            delay *= 2;
        };

        self.registry
            .update_status(name, ServiceStatus::Running, Some(handle.clone()), Some(port))?;
        self.handles.lock().insert(name.to_string(), handle.clone());
        tracing::info!("Started '{}' ({}{})", name, handle, port_suffix(port));

        if let Some(spec) = health {
            let checker = build_checker(
                &spec,
                CheckContext {
                    service: name.to_string(),
                    port,
                    executor: Arc::clone(&self.executor),
                    handle,
                    mode: def.mode(),
                },
            )?;
            let watch = self
                .monitor
                .watch(name, checker, WatchOptions::from(&spec));
            self.watches.lock().insert(name.to_string(), watch);
        }
        Ok(())
    }

    /// One attempt: secure the port, hold it until just before the spawn,
    /// then start the process.
    async fn launch(&self, name: &str, def: &ServiceDefinition) -> Result<Launch> {
        let port = match def.requested_port() {
            0 => 0,
            requested => {
                self.ports
                    .assign_port(name, requested, self.port_policy)
                    .await?
                    .resolved
            }
        };
        let reservation = match port {
            0 => None,
            port => match PortReservation::reserve(port) {
                Ok(reservation) => Some(reservation),
                Err(_) => return Ok(Launch::PortLost(self.ports.conflict_error(port))),
            },
        };

        if self.is_cancelled() {
            return Err(Error::Cancelled(name.to_string()));
        }

        let spec = def.launch_spec(name, port);
        if let Some(reservation) = &reservation {
            reservation.release();
        }
        match self
            .executor
            .start(&spec)
            .instrument(tracing::info_span!("spawn_service"))
            .await
        {
            Ok(handle) => Ok(Launch::Started(handle, port)),
            Err(e) if port > 0 && e.is_address_in_use() => Ok(Launch::PortLost(e)),
            Err(e) => {
                tracing::error!("Failed to start '{}': {}", name, e);
                Err(e)
            }
        }
    }

    fn record_error(&self, name: &str, error: &Error) {
        if let Err(e) = self.registry.mark_error(name, error.to_string()) {
            tracing::debug!("Could not record error for '{}': {}", name, e);
        }
    }

    /// Readiness gate for one service.
    ///
    /// Resolves as soon as the monitor reports `healthy`, immediately when
    /// health checking is disabled, and fails early when a long-running
    /// process exits or the service is stopped before becoming healthy.
    async fn await_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let health_enabled = self
            .registry
            .get(name)
            .is_some_and(|entry| entry.health_enabled);
        if !health_enabled {
            return Ok(());
        }
        let Some(mut states) = self.monitor.state_receiver(name) else {
            return Ok(());
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut liveness = tokio::time::interval(LIVENESS_POLL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let snapshot = states.borrow_and_update().clone();
            if snapshot.state == HealthState::Healthy {
                tracing::info!("'{}' is healthy", name);
                return Ok(());
            }
            if self.is_stopping(name) {
                return Err(Error::OperationFailed {
                    service: name.to_string(),
                    operation: "start".to_string(),
                    reason: "stopped before becoming healthy".to_string(),
                });
            }

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    return Err(Error::Cancelled(name.to_string()));
                }

                _ = &mut deadline => {
                    let snapshot = states.borrow().clone();
                    return Err(Error::HealthTimeout {
                        service: name.to_string(),
                        detail: timeout_detail(&snapshot, timeout),
                    });
                }

                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(Error::HealthTimeout {
                            service: name.to_string(),
                            detail: "health monitoring stopped".to_string(),
                        });
                    }
                }

                _ = liveness.tick() => {
                    if !self.is_stopping(name) {
                        self.check_exited(name).await?;
                    }
                }
            }
        }
    }

    fn is_stopping(&self, name: &str) -> bool {
        self.registry.get(name).is_some_and(|entry| {
            matches!(entry.status, ServiceStatus::Stopping | ServiceStatus::Stopped)
        })
    }

    /// Fail when a service that should keep running has exited.
    async fn check_exited(&self, name: &str) -> Result<()> {
        let Some(handle) = self.handle(name) else {
            return Ok(());
        };
        let mode = self
            .config
            .services
            .get(name)
            .map(|def| def.mode())
            .unwrap_or_default();
        if mode.runs_to_completion() || self.executor.is_running(&handle).await {
            return Ok(());
        }

        let code = self.executor.exit_code(&handle).await;
        if let Some(code) = code {
            let _ = self.registry.update_exit_info(name, code);
        }
        let reason = match code {
            Some(code) => format!("exited with code {} before becoming healthy", code),
            None => "exited before becoming healthy".to_string(),
        };
        let err = Error::ProcessSpawn(name.to_string(), reason);
        self.record_error(name, &err);
        Err(err)
    }

    /// Stop a service (and everything that uses it) or the whole stack.
    ///
    /// Dependents are stopped before their dependencies. Entries are marked
    /// `stopped`, never removed.
    pub async fn stop(&self, target: &Target) -> Result<()> {
        let order = match target {
            Target::All => self.stop_order(None)?,
            Target::Service(name) => {
                if !self.graph.contains(name) {
                    return Err(Error::ServiceNotFound(name.clone()));
                }
                let mut affected: BTreeSet<String> =
                    self.graph.get_all_dependents(name).into_iter().collect();
                affected.insert(name.clone());
                self.stop_order(Some(&affected))?
            }
        };

        let mut errors = Vec::new();
        for name in &order {
            if let Err(e) = self.stop_guarded(name).await {
                tracing::warn!("Failed to stop '{}': {}", name, e);
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    /// Reverse start order, optionally restricted to `only`.
    fn stop_order(&self, only: Option<&BTreeSet<String>>) -> Result<Vec<String>> {
        let mut order = self.graph.topological_sort()?;
        order.reverse();
        if let Some(only) = only {
            order.retain(|name| only.contains(name));
        }
        Ok(order)
    }

    async fn stop_guarded(&self, name: &str) -> Result<()> {
        self.operations
            .execute(name, OperationKind::Stop, self.stop_service(name))
            .await
            .into_result()
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        self.stop_service_impl(name)
            .instrument(tracing::info_span!("stop_service", service.name = %name))
            .await
    }

    async fn stop_service_impl(&self, name: &str) -> Result<()> {
        if let Some(watch) = self.watches.lock().remove(name) {
            watch.cancel();
        }
        self.monitor.unwatch(name);

        let Some(handle) = self.handle(name) else {
            // Never started, or already stopped
            if let Some(entry) = self.registry.get(name) {
                if entry.status != ServiceStatus::Stopped {
                    self.registry
                        .update_status(name, ServiceStatus::Stopped, None, None)?;
                }
            }
            return Ok(());
        };

        self.registry
            .update_status(name, ServiceStatus::Stopping, None, None)?;

        match self.executor.stop(&handle, self.stop_timeout).await {
            Ok(()) => {
                if let Some(code) = self.executor.exit_code(&handle).await {
                    self.registry.update_exit_info(name, code)?;
                }
                self.registry
                    .update_status(name, ServiceStatus::Stopped, None, None)?;
                self.handles.lock().remove(name);
                tracing::info!("Stopped '{}'", name);
                Ok(())
            }
            Err(e) => {
                self.record_error(name, &e);
                Err(e)
            }
        }
    }

    /// Restart one service in place, or stop and start the whole stack.
    ///
    /// A single-service restart waits for the service to become ready again.
    /// Concurrent restarts of the same service share one stop/start cycle.
    pub async fn restart(&self, target: &Target) -> Result<()> {
        match target {
            Target::All => {
                self.stop(&Target::All).await?;
                if self.is_cancelled() {
                    return Err(Error::Cancelled("restart".to_string()));
                }
                self.start_all().await.map(|_| ())
            }
            Target::Service(name) => {
                if !self.graph.contains(name) {
                    return Err(Error::ServiceNotFound(name.clone()));
                }
                let cycle = async {
                    self.stop_service(name).await?;
                    self.spawn_service(name).await?;
                    self.await_ready(name, self.startup_timeout).await
                };
                self.operations
                    .execute(name, OperationKind::Restart, cycle)
                    .instrument(tracing::info_span!("restart_service", service.name = %name))
                    .await
                    .into_result()
            }
        }
    }

    /// Live log lines of a running service.
    pub async fn logs(&self, service: &str) -> Result<BoxStream<'static, String>> {
        let handle = self
            .handle(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;
        self.executor.logs(&handle).await
    }

    /// Cancel everything in flight, stop all services and end health
    /// monitoring. Runs once; later calls return immediately.
    pub async fn shutdown(&self) -> Result<()> {
        if self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        tracing::info!("Shutting down");
        self.cancel();
        let result = self.stop(&Target::All).await;
        self.monitor.shutdown().await;
        result
    }
}

fn port_suffix(port: u16) -> String {
    if port > 0 {
        format!(", port {}", port)
    } else {
        String::new()
    }
}

fn timeout_detail(snapshot: &HealthSnapshot, timeout: Duration) -> String {
    match (&snapshot.state, &snapshot.detail) {
        (HealthState::Starting | HealthState::Unknown, None) => {
            format!("timed out after {:?} waiting for healthy", timeout)
        }
        (state, Some(detail)) => format!("{}: {}", state, detail),
        (state, None) => format!("{} after {:?}", state, timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detail() {
        let mut snapshot = HealthSnapshot {
            state: HealthState::Starting,
            ..HealthSnapshot::default()
        };
        assert_eq!(
            timeout_detail(&snapshot, Duration::from_secs(2)),
            "timed out after 2s waiting for healthy"
        );

        snapshot.state = HealthState::Unhealthy;
        snapshot.detail = Some("connection refused".into());
        assert_eq!(
            timeout_detail(&snapshot, Duration::from_secs(2)),
            "unhealthy: connection refused"
        );
    }

    #[test]
    fn test_target_constructor() {
        assert_eq!(Target::service("api"), Target::Service("api".into()));
    }
}
