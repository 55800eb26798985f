use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use groupgate::app::Components;
use groupgate::config::Config;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Windowed arrival aggregation with idempotent batch delivery.
#[derive(Parser, Debug)]
#[command(name = "groupgate", version, about)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway, stale sweeper and consumer until Ctrl-C.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single sweep pass and print its report.
    Sweep,
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the JSON schema of config.toml.
    Schema,
    /// Print the effective configuration.
    Show,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "groupgate",
                &mut std::io::stdout(),
            );
            Ok(())
        }
        Commands::Config {
            action: ConfigAction::Schema,
        } => {
            println!("{}", serde_json::to_string_pretty(&Config::json_schema())?);
            Ok(())
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render config")?
            );
            Ok(())
        }
        Commands::Sweep => {
            init_tracing();
            let config = Config::load(cli.config.as_deref())?;
            let mut components = Components::open(&config)?;
            let report = components.sweep_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Serve { host, port } => {
            init_tracing();
            let config = Config::load(cli.config.as_deref())?;
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            let components = Components::open(&config)?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl-C: {e}");
                        return;
                    }
                    tracing::info!("Shutdown requested");
                    cancel.cancel();
                }
            });

            components.serve(&host, port, cancel).await
        }
    }
}
