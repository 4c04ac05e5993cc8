use clap::{Parser, Subcommand};
use stackup::port::ConflictPolicy;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackup")]
#[command(about = "Bring up a local multi-service stack in dependency order")]
pub struct Cli {
    /// Stack file path
    #[arg(short, long, env = "STACKUP_CONFIG", default_value = "stackup.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the start levels without starting anything
    Plan {
        /// Services to plan for (defaults to all); dependencies are included
        services: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start services level by level and keep them running until Ctrl-C
    Up {
        /// Services to start (defaults to all); dependencies are included
        services: Vec<String>,

        /// How to resolve port conflicts (overrides the stack file)
        #[arg(long, value_name = "POLICY")]
        port_policy: Option<ConflictPolicy>,

        /// Per-service readiness timeout, e.g. 30s or 2m
        #[arg(long, value_name = "DURATION")]
        timeout: Option<String>,

        /// Stop already-started services when a level fails
        #[arg(long)]
        rollback: bool,
    },
    /// Inspect and manage port assignments
    #[command(subcommand)]
    Ports(PortsCommands),
}

#[derive(Subcommand)]
pub enum PortsCommands {
    /// List stored port assignments
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show whether a port is free and who holds it
    Check { port: u16 },
    /// Drop assignments that have not been used recently
    Clean {
        /// Maximum age, e.g. 7d or 12h
        #[arg(long, value_name = "DURATION", default_value = "7d")]
        max_age: String,
    },
    /// Forget all stored assignments
    Reset,
}
