use anyhow::Result;
use clap::Parser;
use dandi_search_mcp::{ServerConfig, run_server};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// dandi-search Model Context Protocol server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Corpus database file, overriding `storage.path`
    #[arg(long)]
    db: Option<PathBuf>,

    /// Serve the stored index without refreshing it
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run_server(ServerConfig {
        config_path: args.config,
        db_path: args.db,
        read_only: args.read_only,
    })
    .await
}
