//! # tastegraph CLI (`taste`)
//!
//! The `taste` binary is the primary interface for tastegraph. It provides
//! commands for database initialization, extraction-batch ingestion,
//! classified queries, metric rebuilds, and store statistics.
//!
//! ## Usage
//!
//! ```bash
//! taste --config ./config/taste.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `taste init` | Create the SQLite database and run schema migrations |
//! | `taste ingest <file>` | Resolve an extraction batch into the graph |
//! | `taste query <file>` | Execute a classified query and print ranked results |
//! | `taste rebuild-metrics` | Replay the mention store into fresh metrics and scores |
//! | `taste stats` | Print entity/connection/mention statistics |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tastegraph::{config, ingest, migrate, query, stats};

/// tastegraph — an entity resolution and ranking engine for community
/// food-discussion mentions.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/taste.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "taste",
    about = "tastegraph — entity resolution and ranking for community food-discussion mentions",
    version,
    long_about = "tastegraph ingests structured mention batches extracted from community \
    discussion text, resolves them onto a deduplicated restaurant/dish graph with time-decayed \
    quality scores, and serves classified queries with deterministic, evidence-backed rankings."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/taste.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (entities,
    /// connections, mentions). This command is idempotent — running it
    /// multiple times is safe.
    Init,

    /// Ingest an extraction batch.
    ///
    /// Reads a JSON array of extracted mentions, resolves restaurant/dish/
    /// attribute names onto canonical entities, upserts connections, writes
    /// evidence rows, and recomputes metrics and quality scores for
    /// everything the batch touched. Re-ingesting the same batch is a no-op.
    Ingest {
        /// Path to the JSON batch file.
        file: PathBuf,
    },

    /// Execute a classified query.
    ///
    /// Reads a JSON query object (query_type, entity references, filters),
    /// runs the matching retrieval template, and prints the ranked result
    /// as JSON.
    Query {
        /// Path to the JSON query file.
        file: PathBuf,
    },

    /// Rebuild all connection metrics from the mention store.
    ///
    /// Metrics are fully derivable from stored mentions, so this replay is
    /// safe at any time and converges to the same state as incremental
    /// aggregation. Also recomputes every quality score.
    RebuildMetrics,

    /// Print store statistics.
    ///
    /// Entity counts by type, connection activity breakdown, mention
    /// totals, and the current top restaurants by quality score.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file } => {
            ingest::run_ingest(&cfg, &file).await?;
        }
        Commands::Query { file } => {
            query::run_query(&cfg, &file).await?;
        }
        Commands::RebuildMetrics => {
            ingest::run_rebuild(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
