//! copilot-agent CLI entry point

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use copilot_agent::{AgentSession, Config, Error};

#[derive(Parser)]
#[command(name = "copilot-agent")]
#[command(about = "Chat with a Microsoft Copilot Studio agent")]
#[command(version)]
struct Cli {
    /// Send a message to the agent; repeat the flag to send several in order
    #[arg(short, long)]
    message: Vec<String>,

    /// Do not record turns in the conversation context
    #[arg(long)]
    no_context: bool,

    /// Display the current configuration (secrets masked) and exit
    #[arg(long)]
    config: bool,

    /// Path to a JSON config file supplying defaults; the environment wins
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // Double Ctrl+C to exit; a single press is announced and forgiven
    let exit_flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let r = exit_flag.clone();
    ctrlc::set_handler(move || {
        if r.load(std::sync::atomic::Ordering::SeqCst) {
            println!("\nGoodbye!");
            std::process::exit(0);
        } else {
            println!("\nPress Ctrl+C again to exit");
            r.store(true, std::sync::atomic::Ordering::SeqCst);

            let r2 = r.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(3));
                r2.store(false, std::sync::atomic::Ordering::SeqCst);
            });
        }
    })
    .ok();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(err: &Error) -> i32 {
    match err {
        Error::Config(_) => 2,
        Error::Auth(_) => 3,
        _ => 1,
    }
}

async fn run(cli: Cli) -> copilot_agent::Result<()> {
    let config = Config::load_with_file(cli.config_file.as_deref())?;

    if cli.config {
        println!("{}", config.display());
        return Ok(());
    }

    let session = AgentSession::new(config)?;

    if !cli.message.is_empty() {
        let maintain_context = !cli.no_context;
        let agent_name = session.config().agent_name.clone();

        println!("Connecting to {}...\n", agent_name);
        let replies = session
            .send_messages_with(&cli.message, maintain_context)
            .await?;

        for (message, reply) in cli.message.iter().zip(&replies) {
            println!("You: {}", message);
            println!("{}: {}\n", agent_name, reply);
        }
        return Ok(());
    }

    // Interactive chat (default)
    session
        .chat_loop_async(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
        .await
}
