#![allow(unused_assignments)]

//! # stackup
//!
//! Brings a local multi-service development stack up in dependency order.
//!
//! ## Features
//!
//! - **Leveled startup**: services are grouped into levels with Kahn's
//!   algorithm; a level starts only after the previous one is healthy
//! - **Port conflict resolution**: detect who holds a port, then prompt,
//!   kill the owning process tree, or reassign
//! - **Health tracking**: HTTP, TCP and process checks feed a state machine
//!   with grace periods, failure thresholds and deduplicated events
//! - **Service registry**: one lock-protected record per service shared by
//!   the orchestrator, the health monitor and readers
//! - **Single-flight lifecycle**: concurrent start/stop/restart requests for
//!   the same service share one OS-level action
//!
//! ## Quick Start
//!
//! ```no_run
//! use stackup::config::load_config;
//! use stackup::port::PortManager;
//! use stackup::service::ProcessExecutor;
//! use stackup::Orchestrator;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), stackup::Error> {
//! let config = load_config(std::path::Path::new("stackup.yaml"))?;
//! let orchestrator = Orchestrator::new(
//!     config,
//!     Arc::new(ProcessExecutor::new()),
//!     Arc::new(PortManager::for_platform()),
//! )?;
//!
//! let report = orchestrator.start_all().await?;
//! println!("{}", report);
//!
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dependency;
pub mod error;
pub mod healthcheck;
pub mod orchestrator;
pub mod port;
pub mod registry;
pub mod service;

pub use config::{load_config, StackConfig};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, StartupReport, Target};
pub use registry::{Registry, RegistryEntry, ServiceStatus};
