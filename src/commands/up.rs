use stackup::config::{parse_duration_string, StackConfig};
use stackup::healthcheck::Severity;
use stackup::port::{ConflictPolicy, JsonPortStore, JsonPreferenceStore, PortManager};
use stackup::registry::RegistryEntry;
use stackup::service::ProcessExecutor;
use stackup::{Error, Orchestrator};
use std::path::Path;
use std::sync::Arc;

pub struct UpOptions {
    pub services: Vec<String>,
    pub port_policy: Option<ConflictPolicy>,
    pub timeout: Option<String>,
    pub rollback: bool,
}

pub async fn run_up(
    config: StackConfig,
    project_dir: &Path,
    opts: UpOptions,
) -> anyhow::Result<()> {
    let mut ports = PortManager::for_platform()
        .with_store(Arc::new(JsonPortStore::for_project(project_dir)));
    match JsonPreferenceStore::default_location() {
        Ok(prefs) => ports = ports.with_preferences(Arc::new(prefs)),
        Err(e) => tracing::warn!("Preferences unavailable, using defaults: {}", e),
    }

    let mut orchestrator =
        Orchestrator::new(config, Arc::new(ProcessExecutor::new()), Arc::new(ports))?;
    if let Some(policy) = opts.port_policy {
        orchestrator = orchestrator.with_port_policy(policy);
    }
    if let Some(raw) = opts.timeout.as_deref() {
        let timeout = parse_duration_string(raw)
            .ok_or_else(|| anyhow::anyhow!("Invalid --timeout '{}' (expected e.g. 30s, 2m)", raw))?;
        orchestrator = orchestrator.with_startup_timeout(timeout);
    }
    if opts.rollback {
        orchestrator = orchestrator.with_rollback(true);
    }

    let mut events = orchestrator.monitor().subscribe();
    let levels = orchestrator.plan(&opts.services)?;

    let started = tokio::select! {
        result = orchestrator.start(&levels, orchestrator.startup_timeout) => result,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            Err(Error::Cancelled("startup".to_string()))
        }
    };

    let report = match started {
        Ok(report) => report,
        Err(e) => {
            if let Some(report) = e.startup_report() {
                eprintln!("\n{}", report);
            }
            print_status(&orchestrator.registry().list());
            if let Err(stop_err) = orchestrator.shutdown().await {
                tracing::warn!("Shutdown after failed start: {}", stop_err);
            }
            return Err(e.into());
        }
    };

    eprintln!("\n{}", report);
    print_status(&orchestrator.registry().list());
    eprintln!("Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let detail = event
                    .detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default();
                let line = format!(
                    "{}: {} -> {}{}",
                    event.service, event.previous, event.current, detail
                );
                match event.severity {
                    Severity::Critical | Severity::Error => tracing::error!("{}", line),
                    Severity::Warning => tracing::warn!("{}", line),
                    Severity::Info => tracing::info!("{}", line),
                }
            }
        }
    }

    eprintln!("\nStopping services...");
    orchestrator.shutdown().await?;
    print_status(&orchestrator.registry().list());
    Ok(())
}

fn print_status(entries: &[RegistryEntry]) {
    if entries.is_empty() {
        return;
    }
    eprintln!("\n  {:<20} {:<10} {:<10} {:>6}  DETAIL", "SERVICE", "STATUS", "HEALTH", "PORT");
    for entry in entries {
        let port = if entry.port > 0 {
            entry.port.to_string()
        } else {
            "-".to_string()
        };
        let detail = entry
            .error
            .as_deref()
            .or(entry.health_detail.as_deref())
            .unwrap_or("");
        eprintln!(
            "  {:<20} {:<10} {:<10} {:>6}  {}",
            entry.name,
            entry.status.to_string(),
            entry.health.to_string(),
            port,
            detail
        );
    }
    eprintln!();
}
