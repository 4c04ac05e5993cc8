//! Stack configuration: service definitions, health checks and settings.
//!
//! - `types` - `StackConfig`, `Settings` and file loading
//! - `service` - `ServiceDefinition` with type/mode inference
//! - `health` - health check forms and their resolved `HealthCheckSpec`
//! - `duration` - human-readable duration strings

mod duration;
mod health;
mod service;
mod types;

pub use duration::*;
pub use health::*;
pub use service::*;
pub use types::*;
