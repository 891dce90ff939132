use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use offersync_core::CrawlBatchResult;
use offersync_storage::CsvOfferStore;
use offersync_sync::{SyncConfig, Synchronizer};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offersync")]
#[command(about = "Keep a local offer table in step with a listing site's search results")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Offer store file (overrides OFFERSYNC_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Concurrent fetch workers (overrides OFFERSYNC_WORKERS)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Pause after each fetch, per worker (overrides OFFERSYNC_PAUSE_MS)
    #[arg(long, global = true)]
    pause_ms: Option<u64>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl a search URL and reconcile the store with it
    Update {
        search_url: String,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print offer counts
    Stats,
    /// Write offers to a CSV file
    Export {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        include_inactive: bool,
    },
    /// Collapse rows that share an identity
    Dedup,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(global: &GlobalArgs) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env();
    if let Some(db) = &global.db {
        config.db_path = db.clone();
    }
    if let Some(workers) = global.workers {
        config.worker_count = workers;
    }
    if let Some(pause_ms) = global.pause_ms {
        config.pause = Duration::from_millis(pause_ms);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_summary(result: &CrawlBatchResult) {
    println!("run {} for {}", result.run_id, result.search_query);
    println!("  found:    {}", result.total_found);
    println!("  new:      {}", result.new_offers);
    println!("  updated:  {}", result.updated_offers);
    println!("  inactive: {}", result.inactive_offers);
    println!("  failed:   {}", result.failed_scrapes);
    println!("  took:     {:.1}s", result.duration_seconds);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);
    let config = resolve_config(&cli.global)?;
    tracing::debug!(?config, "resolved configuration");

    match cli.command {
        Commands::Update { search_url, json } => {
            let synchronizer = Synchronizer::from_config(&config)?;
            let result = synchronizer.synchronize(&search_url).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
        }
        Commands::Stats => {
            let store = CsvOfferStore::new(&config.db_path);
            let stats = offersync_sync::store_stats(&store).await?;
            println!("store:          {}", config.db_path.display());
            println!("total offers:   {}", stats.total_offers);
            println!("active:         {}", stats.active_offers);
            println!("inactive:       {}", stats.inactive_offers);
            println!("search queries: {}", stats.source_queries);
        }
        Commands::Export {
            output,
            include_inactive,
        } => {
            let store = CsvOfferStore::new(&config.db_path);
            let rows = offersync_sync::export_offers(&store, &output, include_inactive).await?;
            if rows == 0 {
                println!("no offers to export");
            } else {
                println!("exported {rows} offers to {}", output.display());
            }
        }
        Commands::Dedup => {
            let store = CsvOfferStore::new(&config.db_path);
            let removed = offersync_sync::deduplicate_store(&store).await?;
            println!("removed {removed} duplicate rows");
        }
    }

    Ok(())
}
