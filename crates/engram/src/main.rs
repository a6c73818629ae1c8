//! Engram daemon and interactive chat

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use engram::chat::{Conversation, run_repl};
use engram::config::Config;
use engram::error::Result;
use engram::generator::RemoteGenerator;
use engram::memory::MemoryManager;
use engram::server::EngramServer;
use engram::session::SessionId;

/// Engram - compressed conversational memory with periodic reinjection
#[derive(Parser)]
#[command(name = "engram")]
#[command(about = "Compressed conversational memory with periodic reinjection")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP API (default command)
    #[command(name = "serve")]
    Serve,

    /// Chat interactively with memory enabled
    #[command(name = "chat")]
    Chat {
        /// Resume or create the session with this id
        #[arg(long, short = 's')]
        session: Option<String>,

        /// Title for a new session
        #[arg(long, short = 't')]
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    init_logging(default_log_filter(cli.command.as_ref()));
    match cli.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::Chat { session, title }) => chat(config, session, title).await,
    }
}

/// Filter used when `RUST_LOG` is unset. Chat shares the terminal with the
/// REPL, so it only shows warnings.
fn default_log_filter(command: Option<&Command>) -> &'static str {
    match command {
        None | Some(Command::Serve) => "info,engram=debug",
        Some(Command::Chat { .. }) => "warn",
    }
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting Engram daemon");
    tracing::debug!("Config loaded: {:?}", config);
    tracing::info!("Storing sessions under: {}", config.storage.data_dir.display());

    let manager = Arc::new(MemoryManager::from_config(&config).await?);

    let server = EngramServer::new(config.server.clone(), manager);
    tracing::info!("Starting HTTP API on {}", config.server.listen_addr);
    server.serve().await?;

    tracing::info!("Engram daemon stopped");
    Ok(())
}

async fn chat(config: Config, session: Option<String>, title: Option<String>) -> Result<()> {
    let generator = Arc::new(RemoteGenerator::new(&config.generator)?);
    let manager = Arc::new(MemoryManager::from_config(&config).await?);

    let requested = session.map(SessionId::try_from).transpose()?;
    let id = manager.start_session(requested, title.as_deref()).await?;

    let mut conversation =
        Conversation::new(manager, generator, id, config.generator.system_prompt.clone());
    run_repl(
        &mut conversation,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
