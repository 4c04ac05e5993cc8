//! Health state machine.
//!
//! ```text
//!             ┌──────────► healthy ◄──────────┐
//!             │               ▲ │             │
//! starting ───┼───────────────┼─┼─────────────┤
//!             │               │ ▼             │
//!             ├──────────► degraded ◄─────────┤
//!             │               ▲ │             │
//!             └──────────► unhealthy ◄────────┘
//! ```
//!
//! A [`HealthTracker`] is fed one [`CheckResult`] per poll and decides the
//! service's state. It owns the per-service transition history and the
//! dedup memory that decides which transitions are emitted as events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Default window during which a repeated target state is not re-emitted.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default number of consecutive failures that make an unhealthy service critical.
pub const DEFAULT_CRITICAL_THRESHOLD: u32 = 3;

/// Default number of transitions kept per service.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Spawned, no usable verdict yet
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    /// No check has ever run, or checking is disabled
    Unknown,
}

impl HealthState {
    fn is_pending(&self) -> bool {
        matches!(self, HealthState::Starting | HealthState::Unknown)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    /// `Healthy`, `Degraded` or `Unhealthy`
    pub verdict: HealthState,
    pub detail: Option<String>,
    pub latency: Duration,
}

impl CheckResult {
    pub fn healthy() -> Self {
        Self {
            verdict: HealthState::Healthy,
            detail: None,
            latency: Duration::ZERO,
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            verdict: HealthState::Degraded,
            detail: Some(detail.into()),
            latency: Duration::ZERO,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            verdict: HealthState::Unhealthy,
            detail: Some(detail.into()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// One entry of the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: HealthState,
    pub to: HealthState,
    pub severity: Severity,
    pub detail: Option<String>,
    /// False when the dedup window suppressed the event
    pub emitted: bool,
}

/// State-change event published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub service: String,
    pub previous: HealthState,
    pub current: HealthState,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub detail: Option<String>,
}

/// Current view of one service, published on every check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub detail: Option<String>,
    pub consecutive_failures: u32,
    pub checks_run: u64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            detail: None,
            consecutive_failures: 0,
            checks_run: 0,
            last_checked: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub grace_period: Duration,
    pub failure_threshold: u32,
    pub critical_threshold: u32,
    pub dedup_window: Duration,
    pub max_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::ZERO,
            failure_threshold: 1,
            critical_threshold: DEFAULT_CRITICAL_THRESHOLD,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug)]
pub struct HealthTracker {
    service: String,
    config: TrackerConfig,
    state: HealthState,
    started_at: Instant,
    /// Bumped on every restart so stale pollers can detect they were replaced
    epoch: u64,
    consecutive_failures: u32,
    escalated: bool,
    checks_run: u64,
    last_detail: Option<String>,
    last_checked: Option<DateTime<Utc>>,
    /// When each target state was last emitted
    last_emitted: HashMap<HealthState, Instant>,
    history: VecDeque<TransitionRecord>,
}

impl HealthTracker {
    /// New tracker in `starting`, with the grace period counted from `now`.
    pub fn new(service: impl Into<String>, config: TrackerConfig, now: Instant) -> Self {
        Self {
            service: service.into(),
            config,
            state: HealthState::Starting,
            started_at: now,
            epoch: 0,
            consecutive_failures: 0,
            escalated: false,
            checks_run: 0,
            last_detail: None,
            last_checked: None,
            last_emitted: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state,
            detail: self.last_detail.clone(),
            consecutive_failures: self.consecutive_failures,
            checks_run: self.checks_run,
            last_checked: self.last_checked,
        }
    }

    /// Begin a new run (the service was restarted).
    ///
    /// State returns to `starting` and the grace period restarts. History and
    /// dedup memory carry over, so a service that keeps reaching the same
    /// state across restarts does not re-emit it inside the window. The
    /// reset itself is recorded but never emitted.
    pub fn restart(&mut self, config: TrackerConfig, now: Instant) -> u64 {
        if self.state != HealthState::Starting {
            self.push_record(TransitionRecord {
                timestamp: Utc::now(),
                from: self.state,
                to: HealthState::Starting,
                severity: Severity::Info,
                detail: Some("restarted".to_string()),
                emitted: false,
            });
        }
        self.config = config;
        self.state = HealthState::Starting;
        self.started_at = now;
        self.epoch += 1;
        self.consecutive_failures = 0;
        self.escalated = false;
        self.last_detail = None;
        self.epoch
    }

    /// Apply one check result. Returns the event to publish, if any.
    pub fn observe(&mut self, result: &CheckResult, now: Instant) -> Option<HealthEvent> {
        self.checks_run += 1;
        self.last_detail = result.detail.clone();
        self.last_checked = Some(Utc::now());

        if result.verdict == HealthState::Unhealthy {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.consecutive_failures = 0;
        }

        let target = self.resolve(result.verdict, now);

        if target != self.state {
            let severity = self.severity_for(target);
            let from = self.state;
            self.state = target;
            self.escalated = severity == Severity::Critical;
            return self.transition(from, target, severity, result.detail.clone(), now);
        }

        if target == HealthState::Unhealthy
            && !self.escalated
            && self.consecutive_failures >= self.config.critical_threshold
        {
            self.escalated = true;
            return self.transition(
                target,
                target,
                Severity::Critical,
                result.detail.clone(),
                now,
            );
        }

        None
    }

    fn in_grace(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) < self.config.grace_period
    }

    fn resolve(&self, verdict: HealthState, now: Instant) -> HealthState {
        match verdict {
            HealthState::Healthy => HealthState::Healthy,
            HealthState::Degraded => {
                if self.state.is_pending() && self.in_grace(now) {
                    HealthState::Starting
                } else {
                    HealthState::Degraded
                }
            }
            HealthState::Unhealthy => {
                let held = self.in_grace(now)
                    || self.consecutive_failures < self.config.failure_threshold;
                match (held, self.state.is_pending()) {
                    (false, _) => HealthState::Unhealthy,
                    (true, true) => HealthState::Starting,
                    (true, false) => self.state,
                }
            }
            HealthState::Starting | HealthState::Unknown => self.state,
        }
    }

    fn severity_for(&self, target: HealthState) -> Severity {
        match target {
            HealthState::Unhealthy
                if self.consecutive_failures >= self.config.critical_threshold =>
            {
                Severity::Critical
            }
            HealthState::Unhealthy => Severity::Error,
            HealthState::Degraded => Severity::Warning,
            HealthState::Healthy | HealthState::Starting | HealthState::Unknown => Severity::Info,
        }
    }

    /// Record a transition and decide whether it is emitted.
    ///
    /// Each target state has its own window: a target already emitted
    /// within `dedup_window` is suppressed, so a service flapping between
    /// two states emits each of them once per window. A target that has
    /// not been emitted inside its window emits immediately.
    fn transition(
        &mut self,
        from: HealthState,
        to: HealthState,
        severity: Severity,
        detail: Option<String>,
        now: Instant,
    ) -> Option<HealthEvent> {
        let suppressed = self
            .last_emitted
            .get(&to)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.config.dedup_window);

        let record = TransitionRecord {
            timestamp: Utc::now(),
            from,
            to,
            severity,
            detail,
            emitted: !suppressed,
        };
        self.push_record(record.clone());

        if suppressed {
            tracing::debug!(
                service = %self.service,
                state = %to,
                "suppressing repeated health transition inside dedup window"
            );
            return None;
        }

        self.last_emitted.insert(to, now);
        Some(HealthEvent {
            service: self.service.clone(),
            previous: from,
            current: to,
            timestamp: record.timestamp,
            severity,
            detail: record.detail,
        })
    }

    fn push_record(&mut self, record: TransitionRecord) {
        self.history.push_back(record);
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
    }
}
