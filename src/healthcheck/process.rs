use super::{CheckResult, HealthChecker};
use crate::config::HealthCheckType;
use crate::service::{Executor, ServiceHandle, ServiceMode};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Liveness check backed by the executor.
///
/// Long-running services are healthy while alive. Build and task services
/// are also healthy once they exit with code 0; a non-zero exit is
/// unhealthy. Never reports degraded.
pub struct ProcessChecker {
    executor: Arc<dyn Executor>,
    handle: ServiceHandle,
    mode: ServiceMode,
    timeout: Duration,
}

impl ProcessChecker {
    pub fn new(
        executor: Arc<dyn Executor>,
        handle: ServiceHandle,
        mode: ServiceMode,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            handle,
            mode,
            timeout,
        }
    }
}

#[async_trait]
impl HealthChecker for ProcessChecker {
    async fn check(&self) -> CheckResult {
        if self.executor.is_running(&self.handle).await {
            return CheckResult::healthy().with_detail("running");
        }

        let exit_code = self.executor.exit_code(&self.handle).await;
        match (self.mode.runs_to_completion(), exit_code) {
            (true, Some(0)) => CheckResult::healthy().with_detail("completed"),
            (true, None) => {
                CheckResult::healthy().with_detail("completed (exit code not captured)")
            }
            (_, Some(code)) => CheckResult::unhealthy(format!("exited with code {}", code)),
            (false, None) => CheckResult::unhealthy("process not running"),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Process
    }
}
