use crate::cli::PortsCommands;
use stackup::config::parse_duration_string;
use stackup::port::{default_controller, JsonPortStore, PortConflict, PortManager, PortStore};
use std::path::Path;
use std::sync::Arc;

pub fn run_ports(cmd: &PortsCommands, project_dir: &Path) -> anyhow::Result<()> {
    let store = Arc::new(JsonPortStore::for_project(project_dir));

    match cmd {
        PortsCommands::List { json } => list_ports(&store, *json),
        PortsCommands::Check { port } => check_port(*port),
        PortsCommands::Clean { max_age } => clean_ports(store, max_age),
        PortsCommands::Reset => reset_ports(&store),
    }
}

fn list_ports(store: &JsonPortStore, json: bool) -> anyhow::Result<()> {
    let mut assignments = store.all();
    assignments.sort_by_key(|a| a.port);

    if json {
        println!("{}", serde_json::to_string_pretty(&assignments)?);
        return Ok(());
    }

    println!("\nPort Assignments");
    println!("================\n");
    if assignments.is_empty() {
        println!("No ports have been assigned yet.");
        println!("Ports are assigned on `stackup up`.\n");
        return Ok(());
    }
    for a in &assignments {
        println!(
            "  {:>5}  {:<20} last used {}",
            a.port,
            a.service,
            a.last_used.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}

fn check_port(port: u16) -> anyhow::Result<()> {
    let controller = default_controller();
    match PortConflict::check(port, controller.as_ref()) {
        None => println!("Port {} is free", port),
        Some(conflict) if conflict.processes.is_empty() => {
            println!("Port {} is in use (owner unknown)", port)
        }
        Some(conflict) => {
            println!("Port {} is in use:", port);
            for process in &conflict.processes {
                println!("  PID {:<8} {}", process.pid, process.name);
                if let Some(command) = &process.command {
                    println!("               {}", command);
                }
            }
        }
    }
    Ok(())
}

fn clean_ports(store: Arc<JsonPortStore>, max_age: &str) -> anyhow::Result<()> {
    let max_age = parse_duration_string(max_age)
        .ok_or_else(|| anyhow::anyhow!("Invalid --max-age '{}' (expected e.g. 12h, 7d)", max_age))?;
    let manager = PortManager::for_platform().with_store(store);
    let removed = manager.clean_stale(max_age)?;

    if removed.is_empty() {
        println!("No stale port assignments.");
    } else {
        println!("Removed {} stale assignment(s): {}", removed.len(), removed.join(", "));
    }
    Ok(())
}

fn reset_ports(store: &JsonPortStore) -> anyhow::Result<()> {
    let all = store.all();
    for assignment in &all {
        store.remove(&assignment.service)?;
    }
    println!("Cleared {} port assignment(s).", all.len());
    Ok(())
}
