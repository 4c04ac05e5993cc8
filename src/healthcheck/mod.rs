mod breaker;
mod checker;
mod command;
mod http;
mod monitor;
mod process;
mod state;
mod tcp;

pub use breaker::{BreakerState, CircuitBreakerChecker};
pub use checker::HealthChecker;
pub use command::CommandChecker;
pub use http::HttpChecker;
pub use monitor::{HealthEventStream, HealthMonitor, MonitorConfig, WatchHandle, WatchOptions};
pub use process::ProcessChecker;
pub use state::*;
pub use tcp::TcpChecker;

use crate::config::{CheckTarget, HealthCheckSpec};
use crate::error::{Error, Result};
use crate::service::{Executor, ServiceHandle, ServiceMode};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a checker needs to know about the running instance it checks.
#[derive(Clone)]
pub struct CheckContext {
    pub service: String,
    /// Port assigned to the service, 0 when none
    pub port: u16,
    pub executor: Arc<dyn Executor>,
    pub handle: ServiceHandle,
    pub mode: ServiceMode,
}

/// Build the checker for a resolved health check.
///
/// HTTP and TCP checks target the explicitly configured port, falling back
/// to the service's assigned port. Command checks see that port as `PORT`.
/// A configured circuit breaker wraps whichever checker is built.
pub fn build_checker(spec: &HealthCheckSpec, ctx: CheckContext) -> Result<Arc<dyn HealthChecker>> {
    let port = spec.port.unwrap_or(ctx.port);
    let require_port = || {
        if port == 0 {
            Err(Error::Validation(format!(
                "service '{}' has a {} health check but no port",
                ctx.service,
                spec.target.kind()
            )))
        } else {
            Ok(port)
        }
    };

    let checker: Arc<dyn HealthChecker> = match &spec.target {
        CheckTarget::Http { path, discover } => {
            let checker = HttpChecker::local(require_port()?, path, spec.timeout)?
                .with_slow_threshold(spec.slow_threshold);
            if *discover {
                Arc::new(checker.with_discovery())
            } else {
                Arc::new(checker)
            }
        }
        CheckTarget::Tcp => Arc::new(TcpChecker::local(require_port()?, spec.timeout)),
        CheckTarget::Process => Arc::new(ProcessChecker::new(
            Arc::clone(&ctx.executor),
            ctx.handle.clone(),
            ctx.mode,
            spec.timeout,
        )),
        CheckTarget::Command { command } => {
            let mut env = BTreeMap::new();
            if port > 0 {
                env.insert("PORT".to_string(), port.to_string());
            }
            Arc::new(CommandChecker::new(command.clone(), spec.timeout).with_environment(env))
        }
    };

    Ok(match spec.circuit_breaker {
        Some(breaker) => Arc::new(CircuitBreakerChecker::new(&ctx.service, checker, breaker)),
        None => checker,
    })
}
