//! # pdfchat server binary
//!
//! ```bash
//! pdfchat --config ./config/pdfchat.toml serve
//! pdfchat --config ./config/pdfchat.toml sweep
//! ```
//!
//! `serve` runs the HTTP API with the hourly background session sweep;
//! `sweep` runs a single expiry pass and exits (useful from cron or before
//! shutdown). All settings come from the TOML config file; API keys are
//! read from the environment variables it names.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pdfchat::config::load_config;
use pdfchat::server::run_server;
use pdfchat::session::SessionRegistry;

/// Session-scoped retrieval-augmented question answering over uploaded
/// PDFs.
#[derive(Parser)]
#[command(
    name = "pdfchat",
    about = "Session-scoped RAG service: upload a PDF, ask questions, stream grounded answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pdfchat.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve,

    /// Delete all expired sessions and exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdfchat=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => run_server(config).await,
        Commands::Sweep => {
            let registry = SessionRegistry::new(&config.storage.root)?;
            let removed = registry.sweep()?;
            println!("removed {} expired sessions", removed);
            Ok(())
        }
    }
}
