//! Test doubles shared by the integration tests.
//!
//! - `FakeExecutor` "runs" services in-process: a TCP or HTTP service is a
//!   real listener on the launch port, so the real health checkers can reach it
//! - `FakeController` simulates a process table with listeners and children
//!   for the port manager's conflict handling

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use stackup::error::{Error, Result};
use stackup::port::{ProcessController, ProcessInfo};
use stackup::service::{Executor, LaunchSpec, ServiceHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// ============================================================================
// Executor
// ============================================================================

/// How a fake service behaves once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Runs, listens on nothing
    Idle,
    /// Accepts TCP connections on its launch port
    Tcp,
    /// Starts listening for TCP only after this delay
    TcpAfter(Duration),
    /// Answers every HTTP request with this status
    Http(u16),
    /// Never starts
    FailSpawn(String),
    /// Starts and exits right away with this code
    Exit(i32),
}

struct Instance {
    service: String,
    running: bool,
    exit_code: Option<i32>,
    server: Option<JoinHandle<()>>,
}

pub struct FakeExecutor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    instances: Mutex<HashMap<u32, Instance>>,
    events: Mutex<Vec<String>>,
    failing_starts: Mutex<HashMap<String, (usize, String)>>,
    next_pid: AtomicU32,
    start_delay: Duration,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            failing_starts: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(10_000),
            start_delay: Duration::ZERO,
        }
    }

    pub fn with(self, service: &str, behavior: Behavior) -> Self {
        self.behaviors.lock().insert(service.to_string(), behavior);
        self
    }

    /// Make every start take a while, so concurrent callers overlap.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn set_behavior(&self, service: &str, behavior: Behavior) {
        self.behaviors.lock().insert(service.to_string(), behavior);
    }

    /// Fail the next `count` starts of `service` with `reason`, whatever its
    /// behavior.
    pub fn fail_next_starts(&self, service: &str, count: usize, reason: &str) {
        self.failing_starts
            .lock()
            .insert(service.to_string(), (count, reason.to_string()));
    }

    fn take_failure(&self, service: &str) -> Option<String> {
        let mut failing = self.failing_starts.lock();
        let (remaining, reason) = failing.get_mut(service)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(reason.clone())
    }

    /// "start:db", "stop:api", ... in call order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn starts(&self, service: &str) -> usize {
        self.count(&format!("start:{}", service))
    }

    pub fn stops(&self, service: &str) -> usize {
        self.count(&format!("stop:{}", service))
    }

    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Simulate a crash of a running service.
    pub async fn crash(&self, service: &str, code: i32) {
        let server = {
            let mut instances = self.instances.lock();
            let Some(instance) = instances
                .values_mut()
                .find(|i| i.service == service && i.running)
            else {
                return;
            };
            instance.running = false;
            instance.exit_code = Some(code);
            instance.server.take()
        };
        shut_down(server).await;
    }
}

async fn shut_down(server: Option<JoinHandle<()>>) {
    if let Some(server) = server {
        server.abort();
        // Waiting for the aborted task guarantees the listener is closed
        let _ = server.await;
    }
}

async fn serve(spec: &LaunchSpec, http_status: Option<u16>) -> Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", spec.port))
        .await
        .map_err(|e| Error::ProcessSpawn(spec.service.clone(), e.to_string()))?;

    Ok(tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            if let Some(status) = http_status {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} Fake\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    }))
}

fn serve_after(port: u16, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await else {
            return;
        };
        while listener.accept().await.is_ok() {}
    })
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle> {
        self.events.lock().push(format!("start:{}", spec.service));
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if let Some(reason) = self.take_failure(&spec.service) {
            return Err(Error::ProcessSpawn(spec.service.clone(), reason));
        }

        let behavior = self
            .behaviors
            .lock()
            .get(&spec.service)
            .cloned()
            .unwrap_or(Behavior::Idle);

        let (running, exit_code, server) = match behavior {
            Behavior::FailSpawn(reason) => {
                return Err(Error::ProcessSpawn(spec.service.clone(), reason));
            }
            Behavior::Idle => (true, None, None),
            Behavior::Exit(code) => (false, Some(code), None),
            Behavior::Tcp => (true, None, Some(serve(spec, None).await?)),
            Behavior::TcpAfter(delay) => (true, None, Some(serve_after(spec.port, delay))),
            Behavior::Http(status) => (true, None, Some(serve(spec, Some(status)).await?)),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().insert(
            pid,
            Instance {
                service: spec.service.clone(),
                running,
                exit_code,
                server,
            },
        );
        Ok(ServiceHandle::process(&spec.service, pid))
    }

    async fn stop(&self, handle: &ServiceHandle, _timeout: Duration) -> Result<()> {
        self.events.lock().push(format!("stop:{}", handle.service));
        let server = {
            let mut instances = self.instances.lock();
            let Some(instance) = handle.pid().and_then(|pid| instances.get_mut(&pid)) else {
                return Ok(());
            };
            if instance.running {
                instance.running = false;
                instance.exit_code = Some(0);
            }
            instance.server.take()
        };
        shut_down(server).await;
        Ok(())
    }

    async fn is_running(&self, handle: &ServiceHandle) -> bool {
        handle
            .pid()
            .and_then(|pid| self.instances.lock().get(&pid).map(|i| i.running))
            .unwrap_or(false)
    }

    async fn exit_code(&self, handle: &ServiceHandle) -> Option<i32> {
        handle
            .pid()
            .and_then(|pid| self.instances.lock().get(&pid).and_then(|i| i.exit_code))
    }

    async fn logs(&self, handle: &ServiceHandle) -> Result<BoxStream<'static, String>> {
        let lines = vec![format!("{} started", handle.service)];
        Ok(stream::iter(lines).boxed())
    }
}

// ============================================================================
// Process controller
// ============================================================================

struct FakeProcess {
    name: String,
    parent: Option<u32>,
    alive: bool,
    listener: Option<std::net::TcpListener>,
    ignores_term: bool,
    unkillable: bool,
}

/// A process table where "processes" may hold real listening sockets.
#[derive(Default)]
pub struct FakeController {
    processes: Mutex<HashMap<u32, FakeProcess>>,
    signals: Mutex<Vec<(&'static str, u32)>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &self,
        pid: u32,
        name: &str,
        parent: Option<u32>,
        listener: Option<std::net::TcpListener>,
    ) {
        self.processes.lock().insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                parent,
                alive: true,
                listener,
                ignores_term: false,
                unkillable: false,
            },
        );
    }

    /// A process listening on `port` (loopback).
    pub fn listen(&self, pid: u32, name: &str, port: u16) {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        self.insert(pid, name, None, Some(listener));
    }

    pub fn child(&self, pid: u32, parent: u32, name: &str) {
        self.insert(pid, name, Some(parent), None);
    }

    /// The process survives SIGTERM and only dies on a forced kill.
    pub fn ignore_term(&self, pid: u32) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.ignores_term = true;
        }
    }

    /// Neither signal works.
    pub fn make_unkillable(&self, pid: u32) {
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            p.ignores_term = true;
            p.unkillable = true;
        }
    }

    /// ("term" | "kill", pid) in the order they were sent.
    pub fn signals(&self) -> Vec<(&'static str, u32)> {
        self.signals.lock().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.signals
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == "term")
            .map(|(_, pid)| *pid)
            .collect()
    }

    fn die(process: &mut FakeProcess) {
        process.alive = false;
        process.listener = None;
    }
}

impl ProcessController for FakeController {
    fn children(&self, pid: u32) -> Vec<u32> {
        let mut children: Vec<u32> = self
            .processes
            .lock()
            .iter()
            .filter(|(_, p)| p.alive && p.parent == Some(pid))
            .map(|(child, _)| *child)
            .collect();
        children.sort_unstable();
        children
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        self.processes.lock().get(&pid).map(|p| p.name.clone())
    }

    fn find_listeners(&self, port: u16) -> Vec<ProcessInfo> {
        self.processes
            .lock()
            .iter()
            .filter(|(_, p)| {
                p.alive
                    && p
                        .listener
                        .as_ref()
                        .and_then(|l| l.local_addr().ok())
                        .is_some_and(|addr| addr.port() == port)
            })
            .map(|(pid, p)| ProcessInfo::new(*pid, p.name.clone()))
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        self.signals.lock().push(("term", pid));
        if let Some(p) = self.processes.lock().get_mut(&pid) {
            if !p.ignores_term {
                Self::die(p);
            }
        }
        Ok(())
    }

    fn force_kill(&self, pid: u32) -> Result<()> {
        self.signals.lock().push(("kill", pid));
        let mut processes = self.processes.lock();
        let Some(p) = processes.get_mut(&pid) else {
            return Ok(());
        };
        if p.unkillable {
            return Err(Error::KillFailure {
                pid,
                reason: "operation not permitted".to_string(),
            });
        }
        Self::die(p);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().get(&pid).is_some_and(|p| p.alive)
    }
}
