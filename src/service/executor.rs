use super::{LaunchSpec, ServiceHandle};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Launches and stops service instances.
///
/// The orchestrator only talks to services through this trait; process and
/// container backends plug in behind it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch one instance. Returns once the instance exists, not once it is ready.
    async fn start(&self, spec: &LaunchSpec) -> Result<ServiceHandle>;

    /// Graceful stop, escalating to a forced kill once `timeout` elapses.
    /// Stopping an instance that already exited succeeds.
    async fn stop(&self, handle: &ServiceHandle, timeout: Duration) -> Result<()>;

    async fn is_running(&self, handle: &ServiceHandle) -> bool;

    /// Exit code once the instance has ended, when the backend captured one.
    async fn exit_code(&self, _handle: &ServiceHandle) -> Option<i32> {
        None
    }

    /// Output lines: everything buffered so far, then live lines until the
    /// instance exits.
    async fn logs(&self, handle: &ServiceHandle) -> Result<BoxStream<'static, String>>;
}
