//! REST facade entry point
//!
//! Serves one shared agent session over HTTP until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use copilot_agent::server::Server;
use copilot_agent::{AgentSession, Config};

#[derive(Parser)]
#[command(name = "copilot-agent-api")]
#[command(about = "REST facade for a Microsoft Copilot Studio agent")]
#[command(version)]
struct Cli {
    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Path to a JSON config file supplying defaults; the environment wins
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load_with_file(cli.config_file.as_deref())?;
    let session = Arc::new(AgentSession::new(config)?);

    let mut server = Server::bind(&format!("{}:{}", cli.host, cli.port), session).await?;
    println!("copilot-agent API listening on http://{}", server.addr());

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down");
    server.shutdown();

    Ok(())
}
