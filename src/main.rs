mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use stackup::config::load_config;
use stackup::Error as StackError;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(stack_error) = e.downcast_ref::<StackError>() {
            // The itemized report was already printed
            if stack_error.startup_report().is_none() {
                eprintln!("Error: {}", stack_error.with_suggestion());
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let project_dir = commands::project_dir(&cli.config)?;

    if let Commands::Ports(ports_cmd) = &cli.command {
        return commands::run_ports(ports_cmd, &project_dir);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Plan { services, json } => commands::run_plan(&config, &services, json),
        Commands::Up {
            services,
            port_policy,
            timeout,
            rollback,
        } => {
            commands::run_up(
                config,
                &project_dir,
                commands::UpOptions {
                    services,
                    port_policy,
                    timeout,
                    rollback,
                },
            )
            .await
        }
        Commands::Ports(_) => Ok(()),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
