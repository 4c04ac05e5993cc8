use super::{CheckResult, HealthChecker, HealthState};
use crate::config::{HealthCheckType, COMMON_HEALTH_PATHS};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Global shared HTTP client for health checks.
///
/// One connection pool for every checker keeps file descriptor usage flat
/// with many services. Each request carries its own timeout.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to configure shared HTTP client, using defaults: {}", e);
                Client::new()
            })
    })
}

/// HTTP GET check.
///
/// * 2xx: healthy, unless the JSON body reports otherwise or the response
///   was slower than the slow threshold (degraded)
/// * 3xx: degraded; redirects are not followed
/// * 4xx: degraded
/// * 5xx, refused connection, timeout: unhealthy
///
/// With discovery enabled a 404 moves on to the next common health
/// endpoint, and the first endpoint that answers is remembered.
pub struct HttpChecker {
    url: String,
    client: Client,
    timeout: Duration,
    slow_threshold: Option<Duration>,
    /// Primary URL first, then fallbacks
    endpoints: Vec<String>,
    /// Index into `endpoints` of the last endpoint that answered
    active: Mutex<usize>,
}

impl HttpChecker {
    /// Check `url` with the shared client.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is malformed or not http/https.
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        validate_url(&url)?;
        Ok(Self {
            endpoints: vec![url.clone()],
            url,
            client: shared_client().clone(),
            timeout,
            slow_threshold: None,
            active: Mutex::new(0),
        })
    }

    /// Check `path` on a local port.
    pub fn local(port: u16, path: &str, timeout: Duration) -> Result<Self> {
        Self::new(format!("http://127.0.0.1:{}{}", port, path), timeout)
    }

    pub fn with_slow_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Fall back to the common health endpoints on the same origin.
    pub fn with_discovery(mut self) -> Self {
        let Ok(base) = url::Url::parse(&self.url) else {
            return self;
        };
        for path in COMMON_HEALTH_PATHS {
            if let Ok(candidate) = base.join(path) {
                let candidate = candidate.to_string();
                if !self.endpoints.contains(&candidate) {
                    self.endpoints.push(candidate);
                }
            }
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Endpoint used by the most recent answered request.
    pub fn active_url(&self) -> &str {
        &self.endpoints[*self.active.lock()]
    }

    async fn classify(&self, response: Response, started: Instant) -> CheckResult {
        let status = response.status();
        if status.is_server_error() {
            return CheckResult::unhealthy(format!("HTTP {}", status.as_u16()))
                .with_latency(started.elapsed());
        }
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| format!(" to {}", value))
                .unwrap_or_default();
            return CheckResult::degraded(format!(
                "redirected (HTTP {}){}",
                status.as_u16(),
                location
            ))
            .with_latency(started.elapsed());
        }
        if status.is_client_error() {
            return CheckResult::degraded(format!("HTTP {}", status.as_u16()))
                .with_latency(started.elapsed());
        }

        let body = response.text().await.unwrap_or_default();
        let latency = started.elapsed();

        match body_verdict(&body) {
            Some((HealthState::Unhealthy, reported)) => {
                CheckResult::unhealthy(format!("reported status '{}'", reported))
                    .with_latency(latency)
            }
            Some((HealthState::Degraded, reported)) => {
                CheckResult::degraded(format!("reported status '{}'", reported))
                    .with_latency(latency)
            }
            _ => match self.slow_threshold {
                Some(threshold) if latency > threshold => {
                    CheckResult::degraded(format!("slow response: {}ms", latency.as_millis()))
                        .with_latency(latency)
                }
                _ => CheckResult::healthy().with_latency(latency),
            },
        }
    }
}

fn validate_url(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(Error::Config(format!(
                    "Invalid healthcheck URL '{}': scheme must be http or https, got '{}'",
                    url, scheme
                )));
            }
            Ok(())
        }
        Err(e) => Err(Error::Config(format!(
            "Invalid healthcheck URL '{}': {}",
            url, e
        ))),
    }
}

/// Verdict carried by a JSON body's `status` field, if any.
fn body_verdict(body: &str) -> Option<(HealthState, String)> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let status = value.get("status")?.as_str()?.to_ascii_lowercase();
    let state = match status.as_str() {
        "ok" | "up" | "healthy" | "pass" => HealthState::Healthy,
        "degraded" | "warn" | "warning" => HealthState::Degraded,
        "down" | "error" | "unhealthy" | "fail" => HealthState::Unhealthy,
        _ => return None,
    };
    Some((state, status))
}

/// Short description of a failed request ("connection refused", ...).
fn describe_request_error(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        return format!("timed out after {}ms", timeout.as_millis());
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return "connection refused".to_string();
            }
        }
        source = inner.source();
    }

    if err.is_connect() {
        "connection failed".to_string()
    } else {
        err.to_string()
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> CheckResult {
        let started = Instant::now();
        let first = *self.active.lock();
        let count = self.endpoints.len();

        for offset in 0..count {
            let index = (first + offset) % count;
            let response = match self
                .client
                .get(&self.endpoints[index])
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) => response,
                // Every endpoint shares the socket; no point trying the rest
                Err(e) => {
                    return CheckResult::unhealthy(describe_request_error(&e, self.timeout))
                        .with_latency(started.elapsed())
                }
            };

            let missing = response.status() == StatusCode::NOT_FOUND;
            if missing && offset + 1 < count {
                continue;
            }
            if index != first && !missing {
                tracing::debug!("Health endpoint discovered at {}", self.endpoints[index]);
                *self.active.lock() = index;
            }
            return self.classify(response, started).await;
        }

        CheckResult::unhealthy("no health endpoint to check").with_latency(started.elapsed())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection until the test ends.
    async fn serve(status_line: &'static str, body: &'static str, delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    /// Answer 200 on `found`, 404 on every other path.
    async fn serve_path(found: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let status = if path == found { "200 OK" } else { "404 Not Found" };
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(HttpChecker::new("ftp://localhost/x".into(), Duration::from_secs(1)).is_err());
        assert!(HttpChecker::new("not a url".into(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_body_verdict() {
        assert_eq!(
            body_verdict(r#"{"status":"UP"}"#).map(|v| v.0),
            Some(HealthState::Healthy)
        );
        assert_eq!(
            body_verdict(r#"{"status":"warn"}"#).map(|v| v.0),
            Some(HealthState::Degraded)
        );
        assert_eq!(
            body_verdict(r#"{"status":"down"}"#).map(|v| v.0),
            Some(HealthState::Unhealthy)
        );
        assert!(body_verdict("plain text").is_none());
        assert!(body_verdict(r#"{"status":"banana"}"#).is_none());
    }

    #[tokio::test]
    async fn test_refused_connection_is_unhealthy() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let checker = HttpChecker::local(port, "/health", Duration::from_secs(1)).unwrap();
        let result = checker.check().await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert!(result.detail.is_some());
    }

    #[tokio::test]
    async fn test_status_classes() {
        let ok = serve("200 OK", "", Duration::ZERO).await;
        let missing = serve("404 Not Found", "", Duration::ZERO).await;
        let broken = serve("503 Service Unavailable", "", Duration::ZERO).await;
        let timeout = Duration::from_secs(2);

        let result = HttpChecker::local(ok, "/health", timeout).unwrap().check().await;
        assert_eq!(result.verdict, HealthState::Healthy);

        let result = HttpChecker::local(missing, "/health", timeout)
            .unwrap()
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Degraded);
        assert_eq!(result.detail.as_deref(), Some("HTTP 404"));

        let result = HttpChecker::local(broken, "/health", timeout)
            .unwrap()
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert_eq!(result.detail.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn test_json_status_and_slow_threshold() {
        let degraded = serve("200 OK", r#"{"status":"degraded"}"#, Duration::ZERO).await;
        let result = HttpChecker::local(degraded, "/", Duration::from_secs(2))
            .unwrap()
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Degraded);

        let slow = serve("200 OK", "", Duration::from_millis(300)).await;
        let result = HttpChecker::local(slow, "/", Duration::from_secs(2))
            .unwrap()
            .with_slow_threshold(Some(Duration::from_millis(50)))
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Degraded);
        assert!(result.detail.unwrap().starts_with("slow response"));
    }

    #[tokio::test]
    async fn test_redirect_is_not_healthy() {
        let port = serve("302 Found", "", Duration::ZERO).await;
        let result = HttpChecker::local(port, "/health", Duration::from_secs(2))
            .unwrap()
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Degraded);
        assert!(result.detail.unwrap().starts_with("redirected (HTTP 302)"));
    }

    #[tokio::test]
    async fn test_discovery_falls_back_to_common_endpoints() {
        let port = serve_path("/ready").await;
        let checker = HttpChecker::local(port, "/health", Duration::from_secs(2))
            .unwrap()
            .with_discovery();

        assert_eq!(checker.check().await.verdict, HealthState::Healthy);
        assert_eq!(checker.active_url(), format!("http://127.0.0.1:{}/ready", port));
        // Remembered for the next poll
        assert_eq!(checker.check().await.verdict, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_without_discovery_404_is_final() {
        let port = serve_path("/ready").await;
        let checker = HttpChecker::local(port, "/health", Duration::from_secs(2)).unwrap();
        let result = checker.check().await;
        assert_eq!(result.verdict, HealthState::Degraded);
        assert_eq!(result.detail.as_deref(), Some("HTTP 404"));

        let nothing = serve_path("/elsewhere").await;
        let checker = HttpChecker::local(nothing, "/health", Duration::from_secs(2))
            .unwrap()
            .with_discovery();
        assert_eq!(checker.check().await.detail.as_deref(), Some("HTTP 404"));
    }

    #[tokio::test]
    async fn test_timeout_is_unhealthy() {
        let port = serve("200 OK", "", Duration::from_secs(5)).await;
        let result = HttpChecker::local(port, "/", Duration::from_millis(200))
            .unwrap()
            .check()
            .await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert!(result.detail.unwrap().contains("timed out"));
    }
}
