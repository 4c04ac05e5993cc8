use super::{CheckResult, HealthChecker};
use crate::config::HealthCheckType;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Succeeds when a TCP connection to the port can be opened.
pub struct TcpChecker {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn local(port: u16, timeout: Duration) -> Self {
        Self::new("127.0.0.1", port, timeout)
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> CheckResult {
        let started = Instant::now();
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let result = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => CheckResult::healthy(),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                CheckResult::unhealthy("connection refused")
            }
            Ok(Err(e)) => CheckResult::unhealthy(format!("connect failed: {}", e)),
            Err(_) => {
                CheckResult::unhealthy(format!("timed out after {}ms", self.timeout.as_millis()))
            }
        };
        result.with_latency(started.elapsed())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Tcp
    }
}
