//! acmed entry point.

use acme_agent::domain::models::AgentConfig;
use acme_agent::infrastructure::config::ConfigLoader;
use acme_agent::infrastructure::logging::init_logging;
use acme_agent::Agent;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "acmed", version, about = "Endpoint compliance agent daemon")]
struct Cli {
    /// Path to a configuration file (defaults to config.json under the
    /// base directory, plus ACME_* environment overrides).
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default).
    Run,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => {
            let _log_guard =
                init_logging(&config.logging).context("Failed to initialize logging")?;

            // Platform compliance modules register here; the core ships
            // without any and loads what the deployment links in.
            let definitions = Vec::new();

            let agent = Arc::new(
                Agent::bootstrap(config, definitions).context("Failed to assemble the daemon")?,
            );
            agent.run().await.context("Daemon terminated with error")?;
            Ok(())
        }
    }
}
