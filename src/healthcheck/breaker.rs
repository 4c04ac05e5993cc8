//! Per-service circuit breaker around a checker.
//!
//! After `failures` consecutive unhealthy results the breaker opens and the
//! wrapped checker is not called for `open_for`; every poll in that window
//! reports unhealthy. The first poll after the window is a trial check: a
//! non-unhealthy result closes the breaker, another failure reopens it.

use super::{CheckResult, HealthChecker, HealthState};
use crate::config::{CircuitBreakerSpec, HealthCheckType};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreakerChecker {
    service: String,
    inner: Arc<dyn HealthChecker>,
    spec: CircuitBreakerSpec,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerChecker {
    pub fn new(
        service: impl Into<String>,
        inner: Arc<dyn HealthChecker>,
        spec: CircuitBreakerSpec,
    ) -> Self {
        Self {
            service: service.into(),
            inner,
            spec,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.state.lock()
    }

    /// Whether the next poll may call the wrapped checker.
    fn admit(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Open { until } if now < until => false,
            BreakerState::Open { .. } => {
                tracing::debug!(service = %self.service, "circuit breaker half-open, trying again");
                *state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Closed { .. } | BreakerState::HalfOpen => true,
        }
    }

    fn record(&self, failed: bool, now: Instant) {
        let mut state = self.state.lock();
        let next = match (*state, failed) {
            (_, false) => BreakerState::Closed { failures: 0 },
            (BreakerState::Closed { failures }, true) if failures + 1 < self.spec.failures => {
                BreakerState::Closed {
                    failures: failures + 1,
                }
            }
            (_, true) => BreakerState::Open {
                until: now + self.spec.open_for,
            },
        };
        match (*state, next) {
            (BreakerState::Open { .. }, _) => {}
            (_, BreakerState::Open { .. }) => tracing::info!(
                service = %self.service,
                "circuit breaker opened for {}ms",
                self.spec.open_for.as_millis()
            ),
            (BreakerState::HalfOpen, BreakerState::Closed { .. }) => {
                tracing::info!(service = %self.service, "circuit breaker closed")
            }
            _ => {}
        }
        *state = next;
    }
}

#[async_trait]
impl HealthChecker for CircuitBreakerChecker {
    async fn check(&self) -> CheckResult {
        if !self.admit(Instant::now()) {
            return CheckResult::unhealthy("circuit breaker open");
        }
        let result = self.inner.check().await;
        self.record(result.verdict == HealthState::Unhealthy, Instant::now());
        result
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn kind(&self) -> HealthCheckType {
        self.inner.kind()
    }
}
