use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use unified_access::auth::StaticAuthenticator;
use unified_access::config;
use unified_access::http::{self, AppState};
use unified_access::utils::init_logging;
use unified_access::{DataAccessRuntime, Worker};

#[derive(Parser)]
#[command(name = "unified-access")]
#[command(about = "Serve and process CRUD operations over local, remote and queued models", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "unified_access.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the CRUD HTTP surface
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute queued tasks
    Worker,

    /// Create the storage layout and exit
    Migrate,
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    init_logging(&config.logging)?;

    let runtime = DataAccessRuntime::from_config(config)
        .await
        .context("opening data access runtime")?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| runtime.config().server.bind.clone());
            let authenticator = runtime
                .config()
                .auth
                .tokens
                .iter()
                .fold(StaticAuthenticator::new(), |auth, entry| {
                    auth.with_token(entry.token.clone(), entry.principal.clone())
                });
            let state = AppState::new(runtime.clone(), Arc::new(authenticator));
            http::serve(state, &bind, shutdown_signal()).await?;
        }
        Commands::Worker => {
            Worker::new(runtime.clone()).run(shutdown_signal()).await?;
        }
        Commands::Migrate => {
            tracing::info!("Storage layout is installed");
        }
    }

    runtime.close().await;
    Ok(())
}
