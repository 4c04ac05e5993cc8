use super::CheckResult;
use crate::config::HealthCheckType;
use async_trait::async_trait;
use std::time::Duration;

/// A single-shot health check for one service.
///
/// Implementations never fail: every problem (refused connection, timeout,
/// bad status) is folded into the returned [`CheckResult`].
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Run one check
    async fn check(&self) -> CheckResult;

    /// Per-check timeout
    fn timeout(&self) -> Duration;

    fn kind(&self) -> HealthCheckType;
}
