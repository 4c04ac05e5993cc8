use super::{Executor, LaunchSpec, LogCapture, ServiceHandle};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

#[cfg(unix)]
use nix::sys::signal::{self, killpg, Signal};

/// Time allowed for the kernel to reap a process after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// One spawned process. The child itself is owned by a reaper task that
/// publishes the exit code.
struct ManagedProcess {
    service: String,
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    logs: LogCapture,
    /// Set once [`Executor::stop`] has finished with it
    stopped: AtomicBool,
}

impl ManagedProcess {
    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }
}

/// Runs services as local child processes.
///
/// Commands run through `sh -c` in their own process group so a stop
/// signals the whole tree the command spawned. A stopped process is
/// forgotten once its exit code has been read.
#[derive(Default)]
pub struct ProcessExecutor {
    processes: RwLock<HashMap<u32, Arc<ManagedProcess>>>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn managed(&self, handle: &ServiceHandle) -> Option<Arc<ManagedProcess>> {
        let pid = handle.pid()?;
        self.processes.read().get(&pid).cloned()
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(unix)]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
    }
}

/// Exit code of a finished child. Signal deaths map to 128 + signal.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[async_trait]
impl Executor for ProcessExecutor {
    #[tracing::instrument(skip(self, spec), fields(service.name = %spec.service))]
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle> {
        let command = spec.command.as_deref().ok_or_else(|| {
            Error::ProcessSpawn(
                spec.service.clone(),
                "no command to run (image-only services need a container executor)".to_string(),
            )
        })?;

        let mut cmd = Self::shell_command(command);
        cmd.envs(spec.effective_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawn(spec.service.clone(), e.to_string()))?;
        let pid = child.id().ok_or_else(|| {
            Error::ProcessSpawn(
                spec.service.clone(),
                "process exited before its PID could be read".to_string(),
            )
        })?;

        let logs = LogCapture::new(spec.service.clone());
        if let Some(stdout) = child.stdout.take() {
            logs.capture(stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            logs.capture(stderr, true);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let service = spec.service.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    tracing::warn!("Error waiting for process {}: {}", service, e);
                    -1
                }
            };
            tracing::debug!("Process {} (PID {}) exited with code {}", service, pid, code);
            let _ = exit_tx.send(Some(code));
        });

        self.processes.write().insert(
            pid,
            Arc::new(ManagedProcess {
                service: spec.service.clone(),
                pid,
                exit: exit_rx,
                logs,
                stopped: AtomicBool::new(false),
            }),
        );

        tracing::info!("Started {} (PID {})", spec.service, pid);
        Ok(ServiceHandle::process(&spec.service, pid))
    }

    async fn stop(&self, handle: &ServiceHandle, timeout: Duration) -> Result<()> {
        let Some(process) = self.managed(handle) else {
            // Not ours, or already forgotten
            return Ok(());
        };
        if process.exit_code().is_some() {
            process.stopped.store(true, Ordering::SeqCst);
            return Ok(());
        }

        #[cfg(unix)]
        {
            let pid = crate::error::validate_pid(process.pid, &process.service)?;
            let mut exit = process.exit.clone();

            let signalled =
                killpg(pid, Signal::SIGTERM).or_else(|_| signal::kill(pid, Signal::SIGTERM));
            if signalled.is_ok() {
                let graceful = tokio::time::timeout(timeout, exit.wait_for(Option::is_some))
                    .await
                    .is_ok();
                if graceful {
                    tracing::debug!("Process {} exited gracefully", process.service);
                } else {
                    tracing::warn!(
                        "Process {} did not exit after SIGTERM (grace period: {:?}), \
                         sending SIGKILL",
                        process.service,
                        timeout
                    );
                    let _ = killpg(pid, Signal::SIGKILL)
                        .or_else(|_| signal::kill(pid, Signal::SIGKILL));
                    let _ = tokio::time::timeout(KILL_WAIT, exit.wait_for(Option::is_some)).await;
                }
            }

            if process.exit_code().is_none() {
                return Err(Error::KillFailure {
                    pid: process.pid,
                    reason: format!("'{}' is still running after SIGKILL", process.service),
                });
            }
        }

        #[cfg(windows)]
        {
            let controller = crate::port::WindowsProcessController;
            crate::port::kill_process_tree(&controller, process.pid, timeout).await?;
        }

        process.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self, handle: &ServiceHandle) -> bool {
        match self.managed(handle) {
            Some(process) => process.exit_code().is_none(),
            None => false,
        }
    }

    async fn exit_code(&self, handle: &ServiceHandle) -> Option<i32> {
        let process = self.managed(handle)?;
        let code = process.exit_code();
        if code.is_some() && process.stopped.load(Ordering::SeqCst) {
            self.processes.write().remove(&process.pid);
        }
        code
    }

    async fn logs(&self, handle: &ServiceHandle) -> Result<BoxStream<'static, String>> {
        self.managed(handle)
            .map(|process| process.logs.stream())
            .ok_or_else(|| Error::ServiceNotFound(handle.to_string()))
    }
}
