//! Per-service single-flight for lifecycle operations.
//!
//! At most one start/stop/restart runs per service. A caller asking for the
//! same kind of operation that is already in flight joins it and receives
//! its outcome; a caller asking for a different kind waits for the running
//! one to finish and then runs (or joins) in turn.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Start => write!(f, "start"),
            OperationKind::Stop => write!(f, "stop"),
            OperationKind::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    InProgress(OperationKind),
}

type Outcome = std::result::Result<(), Arc<Error>>;

/// Outcome of [`OperationManager::execute`].
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub service: String,
    pub kind: OperationKind,
    pub outcome: Outcome,
    /// True when this caller joined an operation started by someone else
    pub joined: bool,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Convert to a plain `Result`. The original error is returned when this
    /// caller holds the only reference to it.
    pub fn into_result(self) -> Result<()> {
        match self.outcome {
            Ok(()) => Ok(()),
            Err(shared) => Err(Arc::try_unwrap(shared).unwrap_or_else(|shared| {
                Error::OperationFailed {
                    service: self.service,
                    operation: self.kind.to_string(),
                    reason: shared.to_string(),
                }
            })),
        }
    }
}

/// Aggregate of [`OperationManager::execute_bulk`].
#[derive(Debug, Clone)]
pub struct BulkOperationResult {
    pub results: Vec<OperationResult>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl BulkOperationResult {
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

struct InFlight {
    kind: OperationKind,
    done: watch::Receiver<Option<Outcome>>,
}

#[derive(Default)]
struct Slot {
    running: Mutex<Option<InFlight>>,
    last: Mutex<Option<(OperationKind, bool)>>,
}

/// Publishes the outcome and frees the slot, also when the leader's future
/// is dropped before completing.
struct FlightGuard {
    service: String,
    kind: OperationKind,
    slot: Arc<Slot>,
    tx: watch::Sender<Option<Outcome>>,
}

impl FlightGuard {
    /// Free the slot before waking waiters so they can take it over.
    fn finish(&self, outcome: Outcome) {
        *self.slot.running.lock() = None;
        *self.slot.last.lock() = Some((self.kind, outcome.is_ok()));
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.borrow().is_none() {
            self.finish(Err(Arc::new(Error::Cancelled(self.service.clone()))));
        }
    }
}

#[derive(Default)]
pub struct OperationManager {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, service: &str) -> Arc<Slot> {
        Arc::clone(self.slots.lock().entry(service.to_string()).or_default())
    }

    pub fn state(&self, service: &str) -> OperationState {
        self.slots
            .lock()
            .get(service)
            .and_then(|slot| slot.running.lock().as_ref().map(|f| f.kind))
            .map_or(OperationState::Idle, OperationState::InProgress)
    }

    /// Kind and success of the last completed operation on `service`.
    pub fn last_completed(&self, service: &str) -> Option<(OperationKind, bool)> {
        self.slots.lock().get(service).and_then(|slot| *slot.last.lock())
    }

    /// Run `operation` for `service` under single-flight.
    ///
    /// `operation` is only polled when this caller becomes the leader; a
    /// joining caller drops it unpolled.
    pub async fn execute<F>(
        &self,
        service: &str,
        kind: OperationKind,
        operation: F,
    ) -> OperationResult
    where
        F: Future<Output = Result<()>>,
    {
        let slot = self.slot(service);

        let guard = loop {
            let waiting = {
                let mut running = slot.running.lock();
                match running.as_ref() {
                    Some(flight) => (flight.kind == kind, flight.done.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *running = Some(InFlight { kind, done: rx });
                        break FlightGuard {
                            service: service.to_string(),
                            kind,
                            slot: Arc::clone(&slot),
                            tx,
                        };
                    }
                }
            };

            let (same_kind, mut done) = waiting;
            tracing::debug!(
                "'{}' has an operation in progress, waiting ({} requested)",
                service,
                kind
            );
            let outcome = done.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
            if same_kind {
                return OperationResult {
                    service: service.to_string(),
                    kind,
                    outcome: outcome
                        .unwrap_or_else(|| Err(Arc::new(Error::Cancelled(service.to_string())))),
                    joined: true,
                };
            }
        };

        let outcome = operation.await.map_err(Arc::new);
        guard.finish(outcome.clone());
        drop(guard);

        OperationResult {
            service: service.to_string(),
            kind,
            outcome,
            joined: false,
        }
    }

    /// Run one operation per service concurrently.
    pub async fn execute_bulk<F, Fut>(
        &self,
        services: &[String],
        kind: OperationKind,
        operation: F,
    ) -> BulkOperationResult
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let runs = services
            .iter()
            .map(|service| self.execute(service, kind, operation(service.clone())));
        let results = futures::future::join_all(runs).await;

        let success_count = results.iter().filter(|r| r.is_success()).count();
        BulkOperationResult {
            failure_count: results.len() - success_count,
            success_count,
            results,
        }
    }
}
