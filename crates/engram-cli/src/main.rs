use std::path::PathBuf;

use clap::{Parser, Subcommand};
use engram::config::Config;
use engram::storage::JsonFileStore;
use engram_cli::commands::{CodecTestCommand, SessionsCommand, StatsCommand};
use engram_cli::error::CliResult;
use engram_cli::output::OutputFormat;

#[derive(Parser)]
#[command(name = "engram-cli")]
#[command(about = "Engram CLI - Inspect and manage stored session memory")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'd', global = true, help = "Path to data directory")]
    pub data_dir: Option<PathBuf>,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Session management commands")]
    Sessions(SessionsCommand),

    #[clap(about = "Show memory statistics")]
    Stats(StatsCommand),

    #[clap(name = "codec-test", about = "Encode text and report the compression ratio")]
    CodecTest(CodecTestCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let output = match &cli.command {
        Command::CodecTest(cmd) => cmd.execute(format)?,
        Command::Sessions(cmd) => cmd.execute(&open_store(&cli).await?, format).await?,
        Command::Stats(cmd) => cmd.execute(&open_store(&cli).await?, format).await?,
    };

    println!("{output}");
    Ok(())
}

async fn open_store(cli: &Cli) -> CliResult<JsonFileStore> {
    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => Config::load(cli.config.as_deref())?.storage.data_dir,
    };
    Ok(JsonFileStore::open(&data_dir).await?)
}
