//! Process introspection and process-tree termination.
//!
//! Platform specifics live behind [`ProcessController`]; the tree walk and
//! kill ordering in [`kill_process_tree`] are platform independent.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::process::Command;
use std::time::Duration;

/// Grace window between the graceful and the forced kill pass
pub const KILL_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// How long the root may linger after SIGKILL before the kill is reported failed
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Option<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            command: None,
        }
    }
}

/// OS capabilities the port manager needs.
pub trait ProcessController: Send + Sync {
    /// Direct children of `pid`
    fn children(&self, pid: u32) -> Vec<u32>;

    fn process_name(&self, pid: u32) -> Option<String>;

    /// Processes holding a listening socket on `port`
    fn find_listeners(&self, port: u16) -> Vec<ProcessInfo>;

    /// Graceful termination request. A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Forced termination. A process that is already gone is not an error.
    fn force_kill(&self, pid: u32) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Controller for the current platform.
pub fn default_controller() -> Box<dyn ProcessController> {
    #[cfg(unix)]
    {
        Box::new(UnixProcessController)
    }
    #[cfg(not(unix))]
    {
        Box::new(WindowsProcessController)
    }
}

/// `root` and all of its descendants with their depth (root = 0), parents
/// before children. Our own PID is never included.
pub fn collect_tree(controller: &dyn ProcessController, root: u32) -> Vec<(u32, usize)> {
    let own_pid = std::process::id();
    let mut seen = HashSet::from([root]);
    let mut tree = Vec::new();
    let mut queue = VecDeque::from([(root, 0usize)]);

    while let Some((pid, depth)) = queue.pop_front() {
        if pid == own_pid {
            continue;
        }
        tree.push((pid, depth));
        for child in controller.children(pid) {
            if seen.insert(child) {
                queue.push_back((child, depth + 1));
            }
        }
    }
    tree
}

/// Terminate `root` and every descendant.
///
/// Sends a graceful signal deepest-first, waits `grace`, then force-kills
/// survivors deepest-first with the root last. Returns the PIDs of the tree
/// in the order they were signalled.
///
/// # Errors
///
/// [`Error::KillFailure`] when the root is our own process, or when it is
/// still alive after the forced pass.
pub async fn kill_process_tree(
    controller: &dyn ProcessController,
    root: u32,
    grace: Duration,
) -> Result<Vec<u32>> {
    if root == std::process::id() {
        return Err(Error::KillFailure {
            pid: root,
            reason: "refusing to kill our own process".to_string(),
        });
    }

    let mut tree = collect_tree(controller, root);
    // Stable sort keeps BFS order within a depth; the root (depth 0) ends last
    tree.sort_by(|a, b| b.1.cmp(&a.1));
    let order: Vec<u32> = tree.into_iter().map(|(pid, _)| pid).collect();

    tracing::debug!("Terminating process tree of {}: {:?}", root, order);

    let mut root_error = None;
    for &pid in &order {
        if let Err(e) = controller.terminate(pid) {
            tracing::debug!("Graceful termination of {} failed: {}", pid, e);
            if pid == root {
                root_error = Some(e.to_string());
            }
        }
    }

    tokio::time::sleep(grace).await;

    for &pid in &order {
        if !controller.is_alive(pid) {
            continue;
        }
        tracing::debug!("Process {} survived graceful termination, force killing", pid);
        if let Err(e) = controller.force_kill(pid) {
            tracing::warn!("Force kill of {} failed: {}", pid, e);
            if pid == root {
                root_error = Some(e.to_string());
            }
        }
    }

    let deadline = tokio::time::Instant::now() + FORCE_KILL_WAIT;
    while controller.is_alive(root) {
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::KillFailure {
                pid: root,
                reason: root_error
                    .unwrap_or_else(|| "process still running after forced kill".to_string()),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(order)
}

/// POSIX controller: signals through `nix`, introspection through `/proc`
/// where available and `ss` / `lsof` / `pgrep` / `ps` otherwise.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessController;

#[cfg(unix)]
impl UnixProcessController {
    fn signal(&self, pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;

        let target = crate::error::validate_pid(pid, "port owner")?;
        match nix::sys::signal::kill(target, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => Err(Error::KillFailure {
                pid,
                reason: "permission denied".to_string(),
            }),
            Err(e) => Err(Error::KillFailure {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                // The state follows the parenthesised command name
                let after = stat.rsplit_once(')')?.1;
                after.split_whitespace().next().map(|state| state == "Z")
            })
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(_pid: u32) -> bool {
        false
    }
}

#[cfg(unix)]
impl ProcessController for UnixProcessController {
    fn children(&self, pid: u32) -> Vec<u32> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(tasks) = std::fs::read_dir(format!("/proc/{}/task", pid)) {
                let mut children = Vec::new();
                let mut readable = false;
                for task in tasks.flatten() {
                    if let Ok(list) = std::fs::read_to_string(task.path().join("children")) {
                        readable = true;
                        children.extend(parse_pid_list(&list));
                    }
                }
                // Kernels without CONFIG_PROC_CHILDREN fall through to pgrep
                if readable {
                    return children;
                }
            }
        }

        match Command::new("pgrep").args(["-P", &pid.to_string()]).output() {
            Ok(output) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => Vec::new(),
        }
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        if let Ok(comm) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
            return Some(comm.trim().to_string());
        }
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "comm="])
            .output()
            .ok()?;
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!name.is_empty()).then_some(name)
    }

    fn find_listeners(&self, port: u16) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = Vec::new();

        #[cfg(target_os = "linux")]
        {
            if let Ok(output) = Command::new("ss")
                .args(["-tlnp", &format!("sport = :{}", port)])
                .output()
            {
                if output.status.success() {
                    for pid in parse_ss_pids(&String::from_utf8_lossy(&output.stdout)) {
                        let name = self
                            .process_name(pid)
                            .unwrap_or_else(|| "unknown".to_string());
                        let command = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
                            .ok()
                            .map(|s| s.replace('\0', " ").trim().to_string());
                        processes.push(ProcessInfo { pid, name, command });
                    }
                }
            }
        }

        if let Ok(output) = Command::new("lsof")
            .args([
                "-i",
                &format!("TCP:{}", port),
                "-sTCP:LISTEN",
                "-P",
                "-n",
                "-F",
                "pcn",
            ])
            .output()
        {
            if output.status.success() {
                let seen: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
                processes.extend(
                    parse_lsof_output(&String::from_utf8_lossy(&output.stdout))
                        .into_iter()
                        .filter(|p| !seen.contains(&p.pid)),
                );
            }
        }

        processes
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn force_kill(&self, pid: u32) -> Result<()> {
        self.signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = crate::error::validate_pid_for_check(pid) else {
            return false;
        };
        match nix::sys::signal::kill(target, None) {
            Ok(()) => !Self::is_zombie(pid),
            // Exists but belongs to someone else
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Windows controller built on the stock command-line tools
/// (`netstat`, `tasklist`, `taskkill`, PowerShell CIM queries).
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsProcessController;

impl WindowsProcessController {
    fn taskkill(&self, pid: u32, force: bool) -> Result<()> {
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str()];
        if force {
            args.insert(0, "/F");
        }
        let output = Command::new("taskkill").args(&args).output()?;
        if output.status.success() || !self.is_alive(pid) {
            return Ok(());
        }
        Err(Error::KillFailure {
            pid,
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl ProcessController for WindowsProcessController {
    fn children(&self, pid: u32) -> Vec<u32> {
        let query = format!(
            "Get-CimInstance Win32_Process -Filter \"ParentProcessId={}\" | Select-Object -ExpandProperty ProcessId",
            pid
        );
        match Command::new("powershell")
            .args(["-NoProfile", "-Command", &query])
            .output()
        {
            Ok(output) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
            Err(_) => Vec::new(),
        }
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let output = Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/FO", "CSV", "/NH"])
            .output()
            .ok()?;
        parse_tasklist_name(&String::from_utf8_lossy(&output.stdout))
    }

    fn find_listeners(&self, port: u16) -> Vec<ProcessInfo> {
        let Ok(output) = Command::new("netstat").args(["-ano", "-p", "TCP"]).output() else {
            return Vec::new();
        };
        parse_netstat_listeners(&String::from_utf8_lossy(&output.stdout), port)
            .into_iter()
            .map(|pid| {
                let name = self
                    .process_name(pid)
                    .unwrap_or_else(|| "unknown".to_string());
                ProcessInfo::new(pid, name)
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, false)
    }

    fn force_kill(&self, pid: u32) -> Result<()> {
        self.taskkill(pid, true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.process_name(pid).is_some()
    }
}

/// Whitespace separated PIDs (`pgrep`, `/proc/*/children`, PowerShell).
fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// PIDs from `ss -tlnp` output (`users:(("node",pid=123,fd=20))`).
fn parse_ss_pids(output: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut pids = Vec::new();
    for line in output.lines().skip(1) {
        let Some(users) = line.split_whitespace().last() else {
            continue;
        };
        for part in users.split(',') {
            if let Some(pid) = part.strip_prefix("pid=").and_then(|p| p.parse().ok()) {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

/// Processes from `lsof -F pcn` field output.
fn parse_lsof_output(output: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    let mut seen = HashSet::new();
    let mut current: Option<u32> = None;

    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.parse().ok().filter(|pid| seen.insert(*pid));
            if let Some(pid) = current {
                processes.push(ProcessInfo::new(pid, "unknown"));
            }
        } else if let Some(command) = line.strip_prefix('c') {
            if let (Some(pid), Some(last)) = (current, processes.last_mut()) {
                if last.pid == pid {
                    last.name = command.to_string();
                    last.command = Some(command.to_string());
                }
            }
        }
    }
    processes
}

/// PIDs listening on `port` from `netstat -ano` output.
fn parse_netstat_listeners(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Proto  Local Address  Foreign Address  State  PID
        if fields.len() < 5 || !fields[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if !fields[1].ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = fields[4].parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Image name from `tasklist /FO CSV /NH` output.
fn parse_tasklist_name(output: &str) -> Option<String> {
    let line = output.lines().find(|l| l.starts_with('"'))?;
    let name = line.split("\",\"").next()?.trim_start_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}
