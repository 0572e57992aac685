//! # kbstore CLI (`kb`)
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init <tenant>` | Create (or verify) a tenant's collection |
//! | `kb add <tenant> <file>` | Chunk, embed, and store a text file |
//! | `kb query <tenant> "<text>"` | Hybrid vector + keyword query |
//! | `kb get <tenant> <id>` | Print one stored chunk |
//! | `kb delete <tenant> --source <s>` | Delete every chunk of a source |
//! | `kb stats <tenant>` | Chunk count and embedding settings |
//! | `kb serve` | Start the HTTP API |
//!
//! Logging goes to stderr and is controlled by `KB_LOG` (an `EnvFilter`
//! directive) or `-v`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kbstore::commands::{self, AddArgs};
use kbstore::config;
use kbstore::server;
use kbstore::service::QueryOptions;

/// kbstore: hybrid vector + keyword knowledge-base storage on SQLite.
#[derive(Parser)]
#[command(name = "kb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace). Ignored when KB_LOG is set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tenant's collection if it does not exist.
    Init { tenant: String },

    /// Ingest a UTF-8 text file.
    Add {
        tenant: String,
        file: PathBuf,
        /// Source identifier; chunk ids are `<source>_<n>`. Defaults to the file path.
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Run a hybrid query.
    Query {
        tenant: String,
        text: String,
        #[arg(long)]
        top_k: Option<i64>,
        /// 1.0 = pure vector, 0.0 = pure keyword.
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        category: Option<String>,
        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print one stored chunk.
    Get { tenant: String, id: String },

    /// Delete every chunk ingested from a source.
    Delete {
        tenant: String,
        #[arg(long)]
        source: String,
    },

    /// Show collection statistics.
    Stats { tenant: String },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing(verbose: u8) {
    let filter = if let Ok(env) = std::env::var("KB_LOG") {
        EnvFilter::new(env)
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init { tenant } => {
            commands::run_init(&cfg, &tenant).await?;
        }
        Commands::Add {
            tenant,
            file,
            source,
            category,
            chunk_size,
            overlap,
        } => {
            let args = AddArgs {
                source,
                category,
                chunk_size,
                overlap,
            };
            commands::run_add(&cfg, &tenant, &file, args).await?;
        }
        Commands::Query {
            tenant,
            text,
            top_k,
            alpha,
            category,
            json,
        } => {
            let options = QueryOptions {
                top_k,
                alpha,
                category,
            };
            commands::run_query(&cfg, &tenant, &text, options, json).await?;
        }
        Commands::Get { tenant, id } => {
            commands::run_get(&cfg, &tenant, &id).await?;
        }
        Commands::Delete { tenant, source } => {
            commands::run_delete(&cfg, &tenant, &source).await?;
        }
        Commands::Stats { tenant } => {
            commands::run_stats(&cfg, &tenant).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
