use super::{CheckResult, HealthChecker};
use crate::config::{CommandLine, HealthCheckType};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Runs a command; exit code 0 is healthy, anything else unhealthy.
pub struct CommandChecker {
    command: CommandLine,
    timeout: Duration,
    environment: BTreeMap<String, String>,
}

impl CommandChecker {
    pub fn new(command: CommandLine, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            environment: BTreeMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    fn build(&self) -> Option<Command> {
        let mut cmd = match &self.command {
            CommandLine::Shell(line) => {
                let mut cmd = if cfg!(windows) {
                    let mut cmd = Command::new("cmd");
                    cmd.arg("/C");
                    cmd
                } else {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c");
                    cmd
                };
                cmd.arg(line);
                cmd
            }
            CommandLine::Exec(args) => {
                let (program, rest) = args.split_first()?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
        };
        cmd.envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Some(cmd)
    }
}

#[async_trait]
impl HealthChecker for CommandChecker {
    async fn check(&self) -> CheckResult {
        let started = Instant::now();
        let Some(mut cmd) = self.build() else {
            return CheckResult::unhealthy("empty health check command");
        };

        let result = tokio::time::timeout(self.timeout, cmd.status()).await;
        let outcome = match result {
            Ok(Ok(status)) if status.success() => CheckResult::healthy(),
            Ok(Ok(status)) => match status.code() {
                Some(code) => CheckResult::unhealthy(format!("command exited with code {}", code)),
                None => CheckResult::unhealthy("command killed by signal"),
            },
            Ok(Err(e)) => CheckResult::unhealthy(format!("command failed: {}", e)),
            Err(_) => CheckResult::unhealthy(format!(
                "command timed out after {}ms",
                self.timeout.as_millis()
            )),
        };
        outcome.with_latency(started.elapsed())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Command
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::healthcheck::HealthState;

    fn shell(line: &str) -> CommandChecker {
        CommandChecker::new(CommandLine::Shell(line.into()), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_exit_code_decides() {
        assert_eq!(shell("exit 0").check().await.verdict, HealthState::Healthy);

        let result = shell("exit 3").check().await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert_eq!(result.detail.as_deref(), Some("command exited with code 3"));
    }

    #[tokio::test]
    async fn test_exec_form_and_environment() {
        let checker = CommandChecker::new(
            CommandLine::Exec(vec!["sh".into(), "-c".into(), "test \"$PORT\" = 4321".into()]),
            Duration::from_secs(2),
        )
        .with_environment(BTreeMap::from([("PORT".to_string(), "4321".to_string())]));
        assert_eq!(checker.check().await.verdict, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_missing_program_and_timeout() {
        let missing = CommandChecker::new(
            CommandLine::Exec(vec!["stackup-no-such-binary".into()]),
            Duration::from_secs(2),
        );
        let result = missing.check().await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert!(result.detail.unwrap().starts_with("command failed"));

        let slow = CommandChecker::new(
            CommandLine::Shell("sleep 5".into()),
            Duration::from_millis(100),
        );
        let result = slow.check().await;
        assert_eq!(result.verdict, HealthState::Unhealthy);
        assert!(result.detail.unwrap().contains("timed out"));
    }
}
