use clap::{Parser, Subcommand};
use dandi_search_retriever::{CycleReport, EngineConfig, SearchEngine, SearchFilter};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Semantic search over archive dataset metadata.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Corpus database file, overriding `storage.path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull archive changes and publish them (one incremental refresh cycle)
    Ingest {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Re-pull the full archive snapshot and rebuild the index
    Rebuild {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search the index with a natural-language query
    Search {
        query: String,
        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Payload filter as field=value; repeat for AND, use | for OR
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Show similarity scores
        #[arg(short, long)]
        scores: bool,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show engine status
    Status {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Keep the index fresh until interrupted
    Serve,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = args.db {
        config.storage.path = Some(db);
    }
    let engine = SearchEngine::open(config).await?;

    match args.command {
        Commands::Ingest { format } => {
            let report = engine.refresh_now().await?;
            print_report(&report, &format)?;
        }
        Commands::Rebuild { format } => {
            let report = engine.rebuild().await?;
            print_report(&report, &format)?;
        }
        Commands::Search {
            query,
            top_k,
            filters,
            scores,
            format,
        } => {
            let filter = SearchFilter::parse_clauses(&filters)?;
            let filter = (!filter.is_empty()).then_some(filter);
            let results = engine
                .search_with_scores(&query, top_k, filter.as_ref())
                .await?;
            match format {
                OutputFormat::Json if scores => {
                    println!("{}", serde_json::to_string_pretty(&results.hits)?)
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&results.ids())?)
                }
                OutputFormat::Summary => {
                    if results.hits.is_empty() {
                        println!("No results (generation {})", results.generation);
                    }
                    for (rank, hit) in results.hits.iter().enumerate() {
                        if scores {
                            println!("{:>3}. {} ({:.4})", rank + 1, hit.id, hit.score);
                        } else {
                            println!("{:>3}. {}", rank + 1, hit.id);
                        }
                    }
                }
            }
        }
        Commands::Status { format } => {
            let status = engine.status().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Summary => println!("{}", status.summary()),
            }
        }
        Commands::Serve => {
            engine.start().await?;
            tracing::info!("Serving, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn print_report(report: &CycleReport, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Summary => {
            println!(
                "{:?} cycle published generation {} ({})",
                report.mode, report.generation, report.model_id
            );
            println!(
                "  pulled {}, inserted {}, updated {}, unchanged {}, deleted {}",
                report.pulled, report.inserted, report.updated, report.unchanged, report.deleted
            );
            println!(
                "  embedded {}, discarded {}, cursor {}",
                report.embedded, report.discarded, report.cursor.0
            );
            if !report.stale.is_empty() {
                println!("  stale: {}", report.stale.join(", "));
            }
            if let Some(partial) = &report.partial {
                println!("  {partial}");
            }
        }
    }
    Ok(())
}
