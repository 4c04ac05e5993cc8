//! Background polling of health checkers.
//!
//! Each watched service gets one polling task. Results are folded into the
//! service's [`HealthTracker`], the registry's health field is rewritten
//! after every check, and emitted transitions are broadcast to subscribers.
//!
//! Subscribers that fall behind lose the oldest events instead of slowing
//! down polling.

use super::{
    CheckResult, HealthChecker, HealthEvent, HealthSnapshot, HealthState, HealthTracker,
    Severity, TrackerConfig, TransitionRecord, DEFAULT_CRITICAL_THRESHOLD, DEFAULT_DEDUP_WINDOW,
    DEFAULT_MAX_HISTORY,
};
use crate::config::HealthCheckSpec;
use crate::registry::Registry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Extra time granted on top of a checker's own timeout before the poller
/// gives up on it.
const CHECK_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub critical_threshold: u32,
    pub dedup_window: Duration,
    pub max_history: usize,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            max_history: DEFAULT_MAX_HISTORY,
            event_capacity: 256,
        }
    }
}

/// Per-watch polling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub grace_period: Duration,
    pub failure_threshold: u32,
}

impl From<&HealthCheckSpec> for WatchOptions {
    fn from(spec: &HealthCheckSpec) -> Self {
        Self {
            interval: spec.interval,
            grace_period: spec.grace_period,
            failure_threshold: spec.failure_threshold,
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: crate::config::DEFAULT_HEALTH_INTERVAL,
            grace_period: Duration::ZERO,
            failure_threshold: 1,
        }
    }
}

/// Cancels one watch. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    service: String,
    token: CancellationToken,
}

impl WatchHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Stop polling. Takes effect immediately, even mid-check.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Receiver side of the health event broadcast.
pub struct HealthEventStream {
    rx: broadcast::Receiver<HealthEvent>,
}

impl HealthEventStream {
    /// Next event, or `None` once the monitor is gone.
    pub async fn recv(&mut self) -> Option<HealthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Health event subscriber lagged, dropped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<HealthEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Health event subscriber lagged, dropped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

struct Poller {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the monitor remembers about one service. Survives unwatch so
/// history and dedup memory carry across restarts.
struct ServiceSlot {
    tracker: Arc<Mutex<HealthTracker>>,
    state_tx: Arc<watch::Sender<HealthSnapshot>>,
    poller: Option<Poller>,
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    config: MonitorConfig,
    events: broadcast::Sender<HealthEvent>,
    slots: Mutex<HashMap<String, ServiceSlot>>,
    root: CancellationToken,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, MonitorConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            registry,
            config,
            events,
            slots: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    fn tracker_config(&self, options: &WatchOptions) -> TrackerConfig {
        TrackerConfig {
            grace_period: options.grace_period,
            failure_threshold: options.failure_threshold.max(1),
            critical_threshold: self.config.critical_threshold,
            dedup_window: self.config.dedup_window,
            max_history: self.config.max_history,
        }
    }

    /// Start polling `checker` for `service`, replacing any existing watch.
    ///
    /// The service's state restarts at `starting` and the first check runs
    /// immediately. Must be called from within a tokio runtime.
    pub fn watch(
        &self,
        service: &str,
        checker: Arc<dyn HealthChecker>,
        options: WatchOptions,
    ) -> WatchHandle {
        let now = Instant::now();
        let tracker_config = self.tracker_config(&options);
        let token = self.root.child_token();

        let mut slots = self.slots.lock();
        let slot = slots.entry(service.to_string()).or_insert_with(|| ServiceSlot {
            tracker: Arc::new(Mutex::new(HealthTracker::new(
                service,
                tracker_config.clone(),
                now,
            ))),
            state_tx: Arc::new(watch::channel(HealthSnapshot::default()).0),
            poller: None,
        });

        if let Some(previous) = slot.poller.take() {
            previous.token.cancel();
        }

        let (epoch, snapshot) = {
            let mut tracker = slot.tracker.lock();
            let epoch = tracker.restart(tracker_config, now);
            (epoch, tracker.snapshot())
        };
        slot.state_tx.send_replace(snapshot);

        let poll = Poll {
            service: service.to_string(),
            checker,
            tracker: Arc::clone(&slot.tracker),
            epoch,
            state_tx: Arc::clone(&slot.state_tx),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            interval: options.interval,
            token: token.clone(),
        };
        let task = tokio::spawn(
            poll.run()
                .instrument(tracing::debug_span!("health_watch", service.name = %service)),
        );
        slot.poller = Some(Poller {
            token: token.clone(),
            task,
        });

        WatchHandle {
            service: service.to_string(),
            token,
        }
    }

    /// Stop polling a service. Its history is kept.
    pub fn unwatch(&self, service: &str) {
        if let Some(poller) = self
            .slots
            .lock()
            .get_mut(service)
            .and_then(|slot| slot.poller.take())
        {
            poller.token.cancel();
        }
    }

    pub fn is_watching(&self, service: &str) -> bool {
        self.slots
            .lock()
            .get(service)
            .and_then(|slot| slot.poller.as_ref())
            .is_some_and(|poller| !poller.token.is_cancelled())
    }

    /// Current state, `unknown` for services that are not being watched.
    pub fn current_state(&self, service: &str) -> HealthState {
        if !self.is_watching(service) {
            return HealthState::Unknown;
        }
        self.slots
            .lock()
            .get(service)
            .map_or(HealthState::Unknown, |slot| slot.tracker.lock().state())
    }

    /// Receiver that is notified after every check of `service`.
    pub fn state_receiver(&self, service: &str) -> Option<watch::Receiver<HealthSnapshot>> {
        self.slots
            .lock()
            .get(service)
            .map(|slot| slot.state_tx.subscribe())
    }

    /// Transition log of `service`, oldest first.
    pub fn history(&self, service: &str) -> Vec<TransitionRecord> {
        self.slots
            .lock()
            .get(service)
            .map(|slot| slot.tracker.lock().history().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> HealthEventStream {
        HealthEventStream {
            rx: self.events.subscribe(),
        }
    }

    /// Cancel every watch and wait for the pollers to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .slots
            .lock()
            .values_mut()
            .filter_map(|slot| slot.poller.take())
            .map(|poller| poller.task)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct Poll {
    service: String,
    checker: Arc<dyn HealthChecker>,
    tracker: Arc<Mutex<HealthTracker>>,
    epoch: u64,
    state_tx: Arc<watch::Sender<HealthSnapshot>>,
    registry: Arc<Registry>,
    events: broadcast::Sender<HealthEvent>,
    interval: Duration,
    token: CancellationToken,
}

impl Poll {
    async fn run(self) {
        let limit = self.checker.timeout() + CHECK_TIMEOUT_SLACK;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                result = tokio::time::timeout(limit, self.checker.check()) => {
                    result.unwrap_or_else(|_| {
                        CheckResult::unhealthy(format!("timed out after {}ms", limit.as_millis()))
                    })
                }
            };

            let (event, snapshot) = {
                let mut tracker = self.tracker.lock();
                if tracker.epoch() != self.epoch {
                    // Replaced by a newer watch
                    break;
                }
                let event = tracker.observe(&result, Instant::now());
                (event, tracker.snapshot())
            };

            if let Err(e) =
                self.registry
                    .update_health(&self.service, snapshot.state, snapshot.detail.clone())
            {
                tracing::debug!("Skipping registry health update: {}", e);
            }
            self.state_tx.send_replace(snapshot);

            if let Some(event) = event {
                log_event(&event);
                // No subscribers is fine
                let _ = self.events.send(event);
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::debug!("Health polling stopped");
    }
}

fn log_event(event: &HealthEvent) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.severity {
        Severity::Info => tracing::info!(
            service = %event.service,
            "Health {} -> {} {}", event.previous, event.current, detail
        ),
        Severity::Warning => tracing::warn!(
            service = %event.service,
            "Health {} -> {} {}", event.previous, event.current, detail
        ),
        Severity::Error | Severity::Critical => tracing::error!(
            service = %event.service,
            severity = %event.severity,
            "Health {} -> {} {}", event.previous, event.current, detail
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckType;
    use crate::registry::RegistryEntry;
    use crate::service::{ServiceMode, ServiceType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a script of verdicts, repeating the last one forever.
    struct Scripted {
        script: Vec<HealthState>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<HealthState>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthChecker for Scripted {
        async fn check(&self) -> CheckResult {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let verdict = self.script[i.min(self.script.len() - 1)];
            match verdict {
                HealthState::Healthy => CheckResult::healthy(),
                HealthState::Degraded => CheckResult::degraded("slow"),
                _ => CheckResult::unhealthy("connection refused"),
            }
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn kind(&self) -> HealthCheckType {
            HealthCheckType::Tcp
        }
    }

    /// Never answers within the test
    struct Hanging;

    #[async_trait]
    impl HealthChecker for Hanging {
        async fn check(&self) -> CheckResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            CheckResult::healthy()
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(3600)
        }

        fn kind(&self) -> HealthCheckType {
            HealthCheckType::Http
        }
    }

    fn options() -> WatchOptions {
        WatchOptions {
            interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for(monitor: &HealthMonitor, service: &str, state: HealthState) {
        let mut rx = monitor.state_receiver(service).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while rx.borrow_and_update().state != state {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_first_check_is_immediate_and_updates_registry() {
        let registry = Arc::new(Registry::new());
        registry.upsert(RegistryEntry::new("api", ServiceType::Tcp, ServiceMode::Daemon));
        let monitor = HealthMonitor::new(Arc::clone(&registry));

        let handle = monitor.watch(
            "api",
            Scripted::new(vec![HealthState::Healthy]),
            WatchOptions {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        wait_for(&monitor, "api", HealthState::Healthy).await;

        assert_eq!(monitor.current_state("api"), HealthState::Healthy);
        assert_eq!(registry.get("api").unwrap().health, HealthState::Healthy);

        let history = monitor.history("api");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, HealthState::Starting);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_events_broadcast_to_subscribers() {
        let monitor = HealthMonitor::new(Arc::new(Registry::new()));
        let mut events = monitor.subscribe();

        monitor.watch(
            "db",
            Scripted::new(vec![HealthState::Healthy, HealthState::Unhealthy]),
            options(),
        );

        let first = events.recv().await.unwrap();
        assert_eq!(first.current, HealthState::Healthy);
        let second = events.recv().await.unwrap();
        assert_eq!(second.current, HealthState::Unhealthy);
        assert_eq!(second.severity, Severity::Error);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unwatch_cancels_mid_check() {
        let monitor = HealthMonitor::new(Arc::new(Registry::new()));
        monitor.watch("slow", Arc::new(Hanging), options());
        assert!(monitor.is_watching("slow"));

        monitor.unwatch("slow");
        assert!(!monitor.is_watching("slow"));
        assert_eq!(monitor.current_state("slow"), HealthState::Unknown);

        // Shutdown must not wait for the hanging check
        tokio::time::timeout(Duration::from_secs(2), monitor.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rewatch_keeps_history() {
        let monitor = HealthMonitor::new(Arc::new(Registry::new()));
        monitor.watch("api", Scripted::new(vec![HealthState::Healthy]), options());
        wait_for(&monitor, "api", HealthState::Healthy).await;

        monitor.watch("api", Scripted::new(vec![HealthState::Degraded]), options());
        wait_for(&monitor, "api", HealthState::Degraded).await;

        let targets: Vec<HealthState> = monitor.history("api").iter().map(|r| r.to).collect();
        assert_eq!(
            targets,
            vec![
                HealthState::Healthy,
                HealthState::Starting,
                HealthState::Degraded
            ]
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_service_has_no_state() {
        let monitor = HealthMonitor::new(Arc::new(Registry::new()));
        assert_eq!(monitor.current_state("ghost"), HealthState::Unknown);
        assert!(monitor.state_receiver("ghost").is_none());
        assert!(monitor.history("ghost").is_empty());
    }
}
